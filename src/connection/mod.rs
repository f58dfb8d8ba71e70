//! Connection Module
//!
//! Per-connection state and the command dispatch machinery shared by the
//! event loop and the worker pool.
//!
//! ## Architecture
//!
//! ```text
//!   socket bytes
//!        │ recv()
//!        ▼
//! ┌──────────────┐  parse()  ┌───────────────────┐
//! │    Inbox     │──────────>│       Chain       │
//! │ (+spillover) │  Command  │ gate → mode →     │
//! └──────────────┘           │ server → post     │
//!                            └─────────┬─────────┘
//!                                      │ Verdict {outcome, save}
//!              ┌───────────────┬───────┴────────┬───────────────┐
//!              ▼               ▼                ▼               ▼
//!          Continue          Pause         SAVE → Batch        Quit
//!        (keep parsing)  (to the pool)                     (close socket)
//! ```
//!
//! ## Modules
//!
//! - `outcome`: [`Outcome`], [`QuitReason`] and [`Verdict`]
//! - `chain`: The [`Handler`] trait, [`HandlerTable`] and [`Chain`]
//! - `handler`: [`Connection`], [`Context`] and [`ServerStats`]
//! - `socket`: TCP / Unix listeners and streams

pub mod chain;
pub mod handler;
pub mod outcome;
pub mod socket;

// Re-export commonly used types
pub use chain::{Chain, Handler, HandlerTable};
pub use handler::{Batch, Connection, Context, ServerStats};
pub use outcome::{Outcome, QuitReason, Verdict};
pub use socket::{BindError, Endpoint, Listener, Stream};
