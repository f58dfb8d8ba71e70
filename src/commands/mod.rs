//! Command Handlers
//!
//! The handlers plugged into the dispatch chain of a worker process.
//!
//! ## Architecture
//!
//! ```text
//! Client frame
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  session gate   │  (connection::chain)
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │  TaskHandler    │  pool threads only: runs the search backend
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │  worker_table   │  SAVE / PAUSE routing, KEEPALIVE, DRAW_TPOOL
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐
//! │UniversalHandler │  USE, DEBUG, TIMEOUT, QUIT
//! └─────────────────┘
//! ```

pub mod search;
pub mod universal;

// Re-export the handlers
pub use search::{worker_table, TaskHandler};
pub use universal::UniversalHandler;
