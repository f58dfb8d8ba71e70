//! Dispatch Results
//!
//! Every handler in the dispatch chain answers with a [`Verdict`]: what the
//! connection should do next ([`Outcome`]) and whether the command must be
//! kept in the connection's batch (`save`).

use std::fmt;

/// Why a connection is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitReason {
    /// Peer closed the stream
    Closed,
    /// Socket read or write failed
    IoError,
    /// An allocation failed
    NoMemory,
    /// Idle timeout expired
    Timeout,
    /// The owning worker is shutting down
    Stopped,
    /// Client asked to quit
    Normal,
    /// A command failed in a way that ends the session
    Error,
    /// Anything else
    Other,
}

impl fmt::Display for QuitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            QuitReason::Closed => "connection closed by client",
            QuitReason::IoError => "io error",
            QuitReason::NoMemory => "memory not enough",
            QuitReason::Timeout => "io timeout",
            QuitReason::Stopped => "accept server stopped",
            QuitReason::Normal => "normally",
            QuitReason::Error => "error",
            QuitReason::Other => "unknown reason",
        };
        f.write_str(text)
    }
}

/// What happens to the connection after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Keep parsing
    Continue,
    /// Stop parsing and hand the connection to the worker pool
    Pause,
    /// This handler does not claim the command; try the next one
    Next,
    /// Nobody implements the command
    Unimplemented,
    /// Tear the connection down
    Quit(QuitReason),
}

impl Outcome {
    pub fn is_quit(&self) -> bool {
        matches!(self, Outcome::Quit(_))
    }
}

/// A handler's answer: an [`Outcome`] plus the SAVE flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: Outcome,
    pub save: bool,
}

impl Verdict {
    pub const fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            save: false,
        }
    }

    pub const fn cont() -> Self {
        Self::new(Outcome::Continue)
    }

    pub const fn pause() -> Self {
        Self::new(Outcome::Pause)
    }

    pub const fn next() -> Self {
        Self::new(Outcome::Next)
    }

    pub const fn unimplemented() -> Self {
        Self::new(Outcome::Unimplemented)
    }

    pub const fn quit(reason: QuitReason) -> Self {
        Self::new(Outcome::Quit(reason))
    }

    /// Marks the command for saving into the batch.
    pub const fn and_save(mut self) -> Self {
        self.save = true;
        self
    }
}

impl From<Outcome> for Verdict {
    fn from(outcome: Outcome) -> Self {
        Self::new(outcome)
    }
}
