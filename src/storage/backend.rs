//! Search Backend Interface
//!
//! The index/query engine sits behind two traits. A [`Backend`] is shared by
//! the whole worker process; each paused connection opens its own
//! [`SearchContext`] on a pool thread and feeds it the commands of one
//! transaction. The context turns every command into zero or more outbound
//! frames, or declines it with [`Response::Unhandled`].

use crate::protocol::{Command, ErrorCode};
use crate::session::Session;
use thiserror::Error;

/// Failures raised by a search backend.
///
/// These are internal errors: the connection answers with an error frame
/// and is closed. Expected conditions (unknown database, empty query) are
/// reported as ordinary `ERR` frames inside a [`Response`].
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not open the project's databases
    #[error("failed to open database: {0}")]
    Open(String),

    /// The query could not be evaluated
    #[error("query error: {0}")]
    Query(String),

    /// A command payload is malformed
    #[error("command format is incorrect")]
    WrongFormat,
}

impl BackendError {
    /// Status code sent to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            BackendError::WrongFormat => ErrorCode::WrongFormat,
            BackendError::Open(_) | BackendError::Query(_) => ErrorCode::Backend,
        }
    }
}

/// What a search context did with a command.
#[derive(Debug)]
pub enum Response {
    /// Not a command this backend understands
    Unhandled,
    /// Frames to send back, in order (possibly none)
    Frames(Vec<Command<'static>>),
}

impl Response {
    pub fn none() -> Self {
        Response::Frames(Vec::new())
    }

    pub fn one(frame: Command<'static>) -> Self {
        Response::Frames(vec![frame])
    }
}

/// A search engine shared by all connections of a worker.
pub trait Backend: Send + Sync {
    /// Opens a per-connection search context for the project.
    fn open(&self, session: &Session) -> Result<Box<dyn SearchContext>, BackendError>;
}

/// Per-connection search state, alive for one transaction.
pub trait SearchContext: Send {
    /// Executes one command.
    fn execute(&mut self, cmd: &Command<'_>) -> Result<Response, BackendError>;

    /// Names of the databases currently selected.
    fn databases(&self) -> Vec<String>;
}
