//! Worker Pool Module
//!
//! Blocking search work runs on a pool of OS threads so that the worker's
//! single-threaded event loop never stalls.
//!
//! ## Architecture
//!
//! ```text
//!  event loop                         ThreadPool
//!  ──────────                ┌─────────────────────────────┐
//!  Pause ──submit(task)────> │ queue: [task, task, ...]    │
//!                            │          │ FIFO             │
//!  Reaper ─cancel_timeout──> │  ┌───────┴───────┐          │
//!                            │  ▼       ▼       ▼          │
//!                            │ slot0   slot1   slot2 ...   │
//!                            │ (token) (token) (token)     │
//!                            └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `task`: The [`Task`] trait and [`CancelToken`]
//! - `thread_pool`: The elastic [`ThreadPool`]
//! - `reaper`: Periodic cancellation of overdue tasks

pub mod reaper;
pub mod task;
pub mod thread_pool;

// Re-export commonly used types
pub use reaper::{Reaper, ReaperConfig};
pub use task::{CancelToken, Task, TaskStatus};
pub use thread_pool::{PoolError, ShutdownMode, ThreadPool};
