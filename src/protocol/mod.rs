//! Binary Wire Protocol
//!
//! Clients talk to the server with fixed-shape binary frames: an 8-byte
//! header followed by a primary and a secondary payload.
//!
//! ## Modules
//!
//! - `types`: Frame header, [`Command`], opcodes and status codes
//! - `codec`: Incremental decoder with zero-copy dispatch and spillover
//!
//! ## Example
//!
//! ```ignore
//! use searchd::protocol::{opcode, Command, Inbox};
//! use std::ops::ControlFlow;
//!
//! let mut inbox = Inbox::default();
//! inbox.read_from(&mut socket)?;
//! inbox.parse(|cmd| {
//!     println!("{:?}", cmd);
//!     ControlFlow::<()>::Continue(())
//! })?;
//!
//! // Building a response
//! let mut out = bytes::BytesMut::new();
//! Command::ok(201, "demo").encode(&mut out);
//! ```

pub mod codec;
pub mod types;

// Re-export commonly used types for convenience
pub use codec::{FrameError, Inbox, BUFFER_SIZE, MAX_BODY_SIZE};
pub use types::{ok, opcode, Command, ErrorCode, Header, HEADER_LEN, SILENT_MASK};
