//! Pool Tasks
//!
//! A [`Task`] is a unit of blocking work run on a pool thread. Cancellation
//! is cooperative: the pool trips the slot's [`CancelToken`] (task timeout,
//! forced shutdown) and the task notices at its next checkpoint, returning
//! [`TaskStatus::Cancelled`].
//!
//! ```text
//!          execute(&token)
//!   queued ──────────────────► Finished ───► consumed (dropped)
//!     │                     └─► Cancelled ─┐
//!     │                     └─► panic     ─┼─► cancel(self) ── exactly once
//!     └── pool shutdown before start ──────┘
//! ```
//!
//! [`Task::cancel`] takes the task by value, so the cleanup cannot run twice
//! and a finished task can never be cleaned up afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag of one pool slot.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Returns `false` if it was already requested.
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// How a task's `execute` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The work is done; the task is simply dropped
    Finished,
    /// The task observed its token and stopped; the pool runs its cleanup
    Cancelled,
}

/// Blocking work submitted to a [`ThreadPool`](super::ThreadPool).
pub trait Task: Send {
    /// Runs the task, checking `token` at every point where stopping early
    /// is safe.
    fn execute(&mut self, token: &CancelToken) -> TaskStatus;

    /// Releases whatever the task holds after it was cancelled, panicked,
    /// or dropped from the queue by a shutdown.
    fn cancel(self: Box<Self>);

    /// Short label used by the pool dump.
    fn label(&self) -> String {
        "task".to_string()
    }
}
