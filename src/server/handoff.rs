//! Connection Handoff
//!
//! Pool threads give finished connections back to the event loop through
//! an unbounded channel, the same way a self-pipe would carry connection
//! pointers:
//!
//! ```text
//!  pool thread ──push_back(conn)──┐
//!  pool thread ──push_back(conn)──┼──► mpsc ──► pipe reader (event loop)
//!  signal thread ──stop()─────────┘              │
//!                                                ├─ Resume(conn): re-register
//!                                                │    (or quit if stopped)
//!                                                └─ Stop: stop accepting, once
//! ```
//!
//! Once the loop has processed the stop sentinel, a push is refused on the
//! pushing thread and the connection is torn down there with
//! `QuitReason::Stopped`.

use crate::connection::{Connection, QuitReason};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A message for the event loop's pipe reader.
#[derive(Debug)]
pub enum PipeMessage {
    /// A connection coming back from a pool thread
    Resume(Connection),
    /// Stop accepting new connections
    Stop,
}

#[derive(Debug, Default)]
struct Flags {
    stop_sent: AtomicBool,
    stopped: AtomicBool,
}

/// The sending side, cloned into every pool task.
#[derive(Debug, Clone)]
pub struct Handoff {
    tx: mpsc::UnboundedSender<PipeMessage>,
    flags: Arc<Flags>,
}

/// The receiving side, owned by the event loop.
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::UnboundedReceiver<PipeMessage>,
    flags: Arc<Flags>,
}

/// Creates a connected handoff pair.
pub fn channel() -> (Handoff, PipeReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    let flags = Arc::new(Flags::default());
    (
        Handoff {
            tx,
            flags: Arc::clone(&flags),
        },
        PipeReader { rx, flags },
    )
}

impl Handoff {
    /// Returns a connection to the event loop, or tears it down right here
    /// if the loop has stopped.
    pub fn push_back(&self, conn: Connection) {
        if self.is_stopped() {
            debug!(sock = conn.fd(), "server stopped, connection not pushed back");
            conn.quit(QuitReason::Stopped);
            return;
        }
        debug!(sock = conn.fd(), "push connection back to the event loop");
        if let Err(mpsc::error::SendError(message)) = self.tx.send(PipeMessage::Resume(conn)) {
            if let PipeMessage::Resume(conn) = message {
                conn.quit(QuitReason::Stopped);
            }
        }
    }

    /// Asks the loop to stop accepting. Only the first call sends the
    /// sentinel; returns whether this call sent it.
    pub fn stop(&self) -> bool {
        if self.flags.stop_sent.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!("stop requested, sending sentinel to the event loop");
        self.tx.send(PipeMessage::Stop).is_ok()
    }

    /// Whether the loop has processed the stop sentinel.
    pub fn is_stopped(&self) -> bool {
        self.flags.stopped.load(Ordering::Acquire)
    }
}

impl PipeReader {
    /// Waits for the next message. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<PipeMessage> {
        self.rx.recv().await
    }

    /// Records that the loop no longer accepts connections. Returns `false`
    /// if it was already stopped.
    pub fn mark_stopped(&self) -> bool {
        !self.flags.stopped.swap(true, Ordering::AcqRel)
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.stopped.load(Ordering::Acquire)
    }
}
