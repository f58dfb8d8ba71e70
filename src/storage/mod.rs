//! Search Storage Collaborators
//!
//! The concurrency core talks to two external collaborators: a search
//! backend and a bounded cache. This module defines their interfaces and
//! ships in-process implementations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Worker process                       │
//! │                                                          │
//! │   pool thread                 pool thread                │
//! │  ┌──────────────┐            ┌──────────────┐            │
//! │  │SearchContext │            │SearchContext │  (per conn)│
//! │  └──────┬───────┘            └──────┬───────┘            │
//! │         └──────────┬────────────────┘                    │
//! │                    ▼                                     │
//! │          ┌───────────────────┐     ┌────────────────┐    │
//! │          │  Backend (shared) │────>│  LruStore      │    │
//! │          └───────────────────┘     │  (totals)      │    │
//! │                                    └────────────────┘    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `backend`: The [`Backend`] / [`SearchContext`] traits
//! - `cache`: The [`Cache`] trait and the LRU-backed [`LruStore`]
//! - `engine`: [`MemoryBackend`], an in-memory search engine

pub mod backend;
pub mod cache;
pub mod engine;

// Re-export commonly used types
pub use backend::{Backend, BackendError, Response, SearchContext};
pub use cache::{Cache, LruStore};
pub use engine::{Document, MemoryBackend};
