//! # searchd - A Pre-Fork Search Server Core
//!
//! searchd is the concurrency core of a multi-process search server. Clients
//! speak a compact binary protocol; cheap commands are answered on a
//! single-threaded event loop, while anything that touches the index runs on
//! an elastic pool of blocking threads.
//!
//! ## Features
//!
//! - **Binary Wire Protocol**: 8-byte headers, streamed decoding with
//!   spillover for frames larger than the receive buffer
//! - **Ordered Dispatch Chain**: session gate, mode handler, server table and
//!   universal handler, with SAVE batching of settings
//! - **Elastic Thread Pool**: spare-thread accounting, per-task timeouts,
//!   cooperative cancellation with guaranteed cleanup
//! - **Pre-Fork Supervisor**: one listener shared by N workers, respawn on
//!   exit, graceful and immediate shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │ master (supervisor)          sigwait, fork, respawn, grace + SIGKILL    │
//! └───────────────┬─────────────────────────────────────────────────────────┘
//!                 │ fork × N (shared listener)
//!                 ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │ worker                                                                  │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────────────┐     │
//! │  │ event loop  │───>│ Connection  │───>│ Chain                    │     │
//! │  │ (tokio, 1   │    │ Inbox+codec │    │ gate → mode → table →    │     │
//! │  │  thread)    │    └─────────────┘    │ universal                │     │
//! │  └──────▲──────┘                       └────────────┬─────────────┘     │
//! │         │ handoff                          Pause    │                   │
//! │         │                                           ▼                   │
//! │  ┌──────┴─────────────────────────────────────────────────────────┐     │
//! │  │ ThreadPool   ConnectionTask: batch → SearchContext → FINISH    │     │
//! │  │              Reaper: cancel tasks older than the task timeout  │     │
//! │  └────────────────────────────────────────────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use searchd::config::ServerConfig;
//! use searchd::storage::MemoryBackend;
//! use searchd::supervisor::{ProcessContext, Supervisor};
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::default();
//!     let ctx = ProcessContext::bind(config)?;
//!     let supervisor = Supervisor::new(ctx, |config| {
//!         Arc::new(MemoryBackend::new(config.cache_capacity)) as _
//!     });
//!     supervisor.run()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: frame header, commands and the streaming decoder
//! - [`connection`]: per-connection state and the dispatch chain
//! - [`commands`]: the handlers plugged into the chain
//! - [`pool`]: the elastic thread pool and the task reaper
//! - [`server`]: a worker's event loop and the pool handoff
//! - [`supervisor`]: the master process
//! - [`session`]: project selection and home directories
//! - [`storage`]: the search backend seam and an in-memory backend
//! - [`config`]: server settings

pub mod commands;
pub mod config;
pub mod connection;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod supervisor;

// Re-export commonly used types for convenience
pub use config::{ConnectionConfig, PoolConfig, ServerConfig};
pub use connection::{Chain, Connection, Handler, Outcome, QuitReason};
pub use pool::{Task, ThreadPool};
pub use protocol::{Command, ErrorCode, Header};
pub use server::{Worker, WorkerControl};
pub use supervisor::{ProcessContext, Supervisor, SupervisorError};

/// Version of searchd
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
