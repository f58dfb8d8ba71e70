//! Incremental Frame Decoder
//!
//! Each connection owns one [`Inbox`]: a fixed-capacity receive buffer plus
//! an optional spillover allocation for a frame that does not fit in it.
//!
//! ## How Parsing Works
//!
//! ```text
//!  receive buffer (fixed capacity)
//! ┌──────────────┬──────────────┬────────┬─────────────┐
//! │ frame A      │ frame B      │ hdr C  │   free      │
//! └──────────────┴──────────────┴────────┴─────────────┘
//!   dispatched     dispatched     incomplete
//!   by reference   by reference   │
//!                                 ▼
//!                       compacted to offset 0,
//!                       waits for the next read
//! ```
//!
//! 1. Complete frames are handed to the dispatch callback as [`Command`]s
//!    that borrow straight from the buffer. Nothing is copied.
//! 2. A frame whose total size exceeds the buffer capacity is relocated: an
//!    allocation sized exactly to its body receives the bytes already
//!    buffered, and later reads append to it directly while the receive
//!    buffer is empty.
//! 3. After every pass the unconsumed tail is moved to offset 0.
//!
//! The decoder never assumes a read boundary lines up with a frame boundary;
//! a stream delivered one byte at a time yields the same commands as one
//! delivered in a single read.

use crate::protocol::types::{Command, Header, HEADER_LEN};
use std::io::{self, Read};
use std::ops::ControlFlow;
use thiserror::Error;

/// Default capacity of the per-connection receive buffer.
pub const BUFFER_SIZE: usize = 1024;

/// Default upper bound on a single frame body (16 MiB).
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Errors that make a byte stream undecodable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The declared body length exceeds the configured limit
    #[error("frame body too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    /// The spillover allocation for an oversized frame failed
    #[error("out of memory allocating {0} byte frame body")]
    NoMemory(usize),
}

/// A frame being reassembled outside the receive buffer.
#[derive(Debug)]
struct Spillover {
    header: Header,
    body: Vec<u8>,
    filled: usize,
}

impl Spillover {
    fn allocate(header: Header) -> Result<Self, FrameError> {
        let size = header.body_len();
        let mut body = Vec::new();
        body.try_reserve_exact(size)
            .map_err(|_| FrameError::NoMemory(size))?;
        body.resize(size, 0);
        Ok(Self {
            header,
            body,
            filled: 0,
        })
    }

    fn remaining(&self) -> usize {
        self.body.len() - self.filled
    }

    fn append(&mut self, data: &[u8]) -> usize {
        let n = self.remaining().min(data.len());
        self.body[self.filled..self.filled + n].copy_from_slice(&data[..n]);
        self.filled += n;
        n
    }

    fn into_command(self) -> Command<'static> {
        Command::owned(self.header, self.body)
    }
}

/// Receive side of a connection.
#[derive(Debug)]
pub struct Inbox {
    buf: Box<[u8]>,
    len: usize,
    spill: Option<Spillover>,
    max_body: usize,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new(BUFFER_SIZE, MAX_BODY_SIZE)
    }
}

impl Inbox {
    /// Creates an inbox with the given buffer capacity and body limit.
    pub fn new(capacity: usize, max_body: usize) -> Self {
        let capacity = capacity.max(HEADER_LEN);
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            spill: None,
            max_body,
        }
    }

    /// Capacity of the fixed receive buffer.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes currently held in the receive buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0 && self.spill.is_none()
    }

    /// `(filled, total)` of the frame body being reassembled, if any.
    pub fn spillover(&self) -> Option<(usize, usize)> {
        self.spill.as_ref().map(|s| (s.filled, s.body.len()))
    }

    /// Drops buffered bytes and any partial spillover frame.
    pub fn clear(&mut self) {
        self.len = 0;
        self.spill = None;
    }

    /// Performs one read from `reader`.
    ///
    /// While a large frame is pending and the buffer is empty, bytes land
    /// directly in the spillover allocation; otherwise they are appended to
    /// the receive buffer. Interrupted reads are retried. `Ok(0)` means the
    /// peer closed the stream.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let capacity = self.buf.len();
        let direct = matches!(&self.spill, Some(s) if self.len == 0 && s.remaining() > capacity);

        let target: &mut [u8] = match self.spill.as_mut() {
            Some(spill) if direct => &mut spill.body[spill.filled..],
            _ => &mut self.buf[self.len..],
        };
        debug_assert!(!target.is_empty(), "receive buffer full with no complete frame");

        let n = loop {
            match reader.read(target) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        match self.spill.as_mut() {
            Some(spill) if direct => spill.filled += n,
            _ => self.len += n,
        }
        Ok(n)
    }

    /// Decodes every complete frame currently available.
    ///
    /// `dispatch` returns `ControlFlow::Break(value)` to stop scanning; the
    /// value is returned and any bytes after the stopping frame stay
    /// buffered for the next call. `Ok(None)` means the buffer was exhausted.
    pub fn parse<T, F>(&mut self, mut dispatch: F) -> Result<Option<T>, FrameError>
    where
        F: FnMut(Command<'_>) -> ControlFlow<T>,
    {
        let mut off = 0;
        let mut stopped = None;

        if let Some(spill) = self.spill.as_mut() {
            off = spill.append(&self.buf[..self.len]);
            if spill.remaining() == 0 {
                if let Some(spill) = self.spill.take() {
                    if let ControlFlow::Break(value) = dispatch(spill.into_command()) {
                        stopped = Some(value);
                    }
                }
            }
        }

        while stopped.is_none() {
            let avail = &self.buf[off..self.len];
            let Some(header) = Header::decode(avail) else {
                break;
            };

            let body_len = header.body_len();
            if body_len > self.max_body {
                return Err(FrameError::TooLarge {
                    size: body_len,
                    max: self.max_body,
                });
            }

            let frame_len = header.frame_len();
            if frame_len <= avail.len() {
                let body = &self.buf[off + HEADER_LEN..off + frame_len];
                off += frame_len;
                if let ControlFlow::Break(value) = dispatch(Command::borrowed(header, body)) {
                    stopped = Some(value);
                }
            } else if frame_len > self.buf.len() {
                let mut spill = Spillover::allocate(header)?;
                spill.append(&self.buf[off + HEADER_LEN..self.len]);
                off = self.len;
                self.spill = Some(spill);
                break;
            } else {
                break;
            }
        }

        self.buf.copy_within(off..self.len, 0);
        self.len -= off;
        Ok(stopped)
    }
}
