//! Worker Server
//!
//! The part of a worker process that moves connections between the event
//! loop and the thread pool.
//!
//! ```text
//!  ┌─────────────┐  Pause   ┌────────────────┐
//!  │ event_loop  │ ───────► │ ConnectionTask │  (pool thread)
//!  │  (tokio,    │          └───────┬────────┘
//!  │  1 thread)  │ ◄── handoff ─────┘ FINISH
//!  └─────────────┘
//! ```
//!
//! - [`event_loop`]: accept loop, per-connection readiness, shutdown
//! - [`task`]: a search transaction running on a pool thread
//! - [`handoff`]: the channel that brings connections back to the loop

pub mod event_loop;
pub mod handoff;
pub mod task;

pub use event_loop::{Services, Worker, WorkerControl};
pub use handoff::{Handoff, PipeMessage, PipeReader};
pub use task::ConnectionTask;
