//! Process Supervisor
//!
//! The server runs as one master process and N forked workers that share a
//! single listening socket. The kernel decides which worker accepts each
//! new client.
//!
//! ```text
//!                ┌──────────────────────────────┐
//!                │ master                       │
//!                │  ProcessContext (listener)   │
//!                │  sigwait: CHLD INT TERM QUIT │
//!                └───┬──────────┬───────────┬───┘
//!               fork │          │           │ respawn on SIGCHLD
//!                    ▼          ▼           ▼
//!               ┌────────┐ ┌────────┐  ┌────────┐
//!               │worker 1│ │worker 2│  │worker N│   event loop + pool each
//!               └────────┘ └────────┘  └────────┘
//! ```
//!
//! ## Signals
//!
//! | signal            | master                                | worker            |
//! |-------------------|---------------------------------------|-------------------|
//! | `SIGCHLD`         | reap and respawn                      | -                 |
//! | `SIGINT`          | broadcast `SIGINT`, wait, kill        | graceful stop     |
//! | `SIGTERM`         | broadcast `SIGTERM`, wait, kill       | immediate stop    |
//! | `SIGQUIT`         | same as `SIGTERM`, exits with error   | immediate stop    |
//! | `SIGHUP`          | logged, nothing to reload             | logged            |

pub mod master;
pub mod signals;

pub use master::{ProcessContext, Supervisor, WorkerTable};

use crate::connection::BindError;
use nix::sys::signal::Signal;
use thiserror::Error;

/// Errors raised by the master process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("failed to {action}: {source}")]
    Sys {
        action: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("worker failed: {0:#}")]
    Worker(anyhow::Error),

    #[error("terminated by exceptional signal {0:?}")]
    Exceptional(Signal),
}

impl SupervisorError {
    pub(crate) fn sys(action: &'static str) -> impl FnOnce(nix::Error) -> Self {
        move |source| SupervisorError::Sys { action, source }
    }
}
