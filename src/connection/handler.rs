//! Connection State
//!
//! A [`Connection`] is everything the server knows about one client:
//!
//! ```text
//! Connection
//! ├── Inbox            receive buffer + spillover (protocol::codec)
//! └── Context          what handlers see
//!     ├── Stream       the socket
//!     ├── outbox       fixed-size send buffer
//!     ├── Batch        commands saved for the next pool task
//!     ├── Session      selected project (after USE)
//!     ├── search       backend context while running on a pool thread
//!     ├── timeout      idle timeout (None = unlimited)
//!     └── last_status  status code of the last response
//! ```
//!
//! The inbox and the context are separate fields so that a command can
//! borrow from the receive buffer while handlers mutate the context.
//!
//! ## Ownership
//!
//! A connection is owned by exactly one thread at any time: the event loop
//! while it is registered for readiness, or a pool thread while it runs a
//! task. It moves between them by value and is never shared.
//!
//! ## Sending
//!
//! Responses are encoded into the send buffer and flushed when it fills up
//! and at the end of every parse pass. Interrupted writes are retried.
//! On the event loop a full socket buffer is waited out with a short sleep.
//! On a pool thread writes give up after the blocking slice, and the send
//! is abandoned once the task's cancel token is tripped.

use crate::config::ConnectionConfig;
use crate::connection::chain::{Chain, Handler};
use crate::connection::outcome::{Outcome, QuitReason, Verdict};
use crate::connection::socket::Stream;
use crate::pool::CancelToken;
use crate::protocol::{opcode, Command, ErrorCode, FrameError, Inbox};
use crate::session::Session;
use crate::storage::SearchContext;
use bytes::BytesMut;
use std::collections::{TryReserveError, VecDeque};
use std::fmt::{self, Write as _};
use std::io::{self, Write};
use std::ops::ControlFlow;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Pause before retrying a write that would block.
const SEND_BACKOFF: Duration = Duration::from_millis(5);

/// Upper bound of the DEBUG dump.
const DEBUG_DUMP_LIMIT: usize = 4096;

/// Statistics shared by every connection of a worker.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently open connections (on the loop or on a pool thread)
    pub active_connections: AtomicU64,
    /// Total commands dispatched
    pub commands_processed: AtomicU64,
    /// Total connections handed to the pool
    pub tasks_submitted: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// Commands saved for execution on a pool thread, in arrival order.
#[derive(Debug, Default)]
pub struct Batch {
    cmds: VecDeque<Command<'static>>,
}

impl Batch {
    /// Appends a command, reporting allocation failure.
    pub fn push(&mut self, cmd: Command<'static>) -> Result<(), TryReserveError> {
        self.cmds.try_reserve(1)?;
        self.cmds.push_back(cmd);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<Command<'static>> {
        self.cmds.pop_front()
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    pub fn clear(&mut self) {
        self.cmds.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command<'static>> {
        self.cmds.iter()
    }
}

/// The handler-visible half of a connection.
pub struct Context {
    stream: Stream,
    fd: RawFd,
    peer: String,
    outbox: BytesMut,
    out_capacity: usize,
    batch: Batch,
    session: Option<Arc<Session>>,
    search: Option<Box<dyn SearchContext>>,
    timeout: Option<Duration>,
    last_status: u16,
    buffered: usize,
    cancel: Option<CancelToken>,
    stats: Arc<ServerStats>,
}

impl Context {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn batch_mut(&mut self) -> &mut Batch {
        &mut self.batch
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    pub fn set_session(&mut self, session: Arc<Session>) {
        self.session = Some(session);
    }

    /// Idle timeout; `None` means wait forever.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Sets the idle timeout in seconds; 0 disables it.
    pub fn set_timeout_secs(&mut self, secs: u16) {
        self.timeout = (secs > 0).then(|| Duration::from_secs(u64::from(secs)));
    }

    pub fn last_status(&self) -> u16 {
        self.last_status
    }

    pub fn search(&self) -> Option<&dyn SearchContext> {
        self.search.as_deref()
    }

    pub fn search_mut(&mut self) -> Option<&mut (dyn SearchContext + 'static)> {
        self.search.as_deref_mut()
    }

    pub fn set_search(&mut self, search: Option<Box<dyn SearchContext>>) {
        self.search = search;
    }

    /// Queues a frame for sending, flushing first if it would not fit.
    pub fn respond(&mut self, frame: &Command<'_>) -> io::Result<()> {
        self.last_status = frame.arg();
        let len = frame.header.frame_len();
        if !self.outbox.is_empty() && self.outbox.len() + len > self.out_capacity {
            self.flush()?;
        }
        frame.encode(&mut self.outbox);
        trace!(sock = self.fd, opcode = opcode::name(frame.opcode()), arg = frame.arg(), "queued response");
        if self.outbox.len() >= self.out_capacity {
            self.flush()?;
        }
        Ok(())
    }

    /// Sends a frame and turns the result into a verdict.
    pub fn reply(&mut self, frame: Command<'_>) -> Verdict {
        match self.respond(&frame) {
            Ok(()) => Verdict::cont(),
            Err(e) => {
                debug!(sock = self.fd, error = %e, "failed to send response");
                Verdict::quit(QuitReason::IoError)
            }
        }
    }

    pub fn reply_ok(&mut self, code: u16, payload: impl Into<Vec<u8>>) -> Verdict {
        self.reply(Command::ok(code, payload))
    }

    pub fn reply_err(&mut self, code: ErrorCode) -> Verdict {
        self.reply(Command::err(code))
    }

    /// Writes out the send buffer.
    pub fn flush(&mut self) -> io::Result<()> {
        let mut sent = 0;
        let result = loop {
            if sent >= self.outbox.len() {
                break Ok(());
            }
            match self.stream.write(&self.outbox[sent..]) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    match &self.cancel {
                        Some(token) if token.is_cancelled() => {
                            debug!(sock = self.fd, unsent = self.outbox.len() - sent, "send abandoned, task canceled");
                            break Err(io::Error::new(io::ErrorKind::Other, "send canceled"));
                        }
                        Some(_) => {}
                        None => std::thread::sleep(SEND_BACKOFF),
                    }
                }
                Err(e) => break Err(e),
            }
        };
        if sent > 0 {
            self.stats.bytes_written(sent);
        }
        self.outbox.clear();
        result
    }

    /// Text for the DEBUG command.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let (name, home) = match &self.session {
            Some(s) => (s.name().to_string(), s.home().display().to_string()),
            None => ("-".to_string(), "-".to_string()),
        };
        let _ = writeln!(
            out,
            "socket:[{}] peer:{} name:{} home:{} rcv_size:{} timeout:{}",
            self.fd,
            self.peer,
            name,
            home,
            self.buffered,
            self.timeout.map_or(0, |t| t.as_secs())
        );
        out.push_str("dbs list:");
        for db in self.search.as_ref().map(|s| s.databases()).unwrap_or_default() {
            let _ = write!(out, " [{db}] ->");
        }
        out.push_str(" [NULL]\ncmds list:\n");

        let mut omitted = false;
        for cmd in self.batch.iter() {
            if out.len() >= DEBUG_DUMP_LIMIT - 256 {
                omitted = true;
                break;
            }
            let h = cmd.header;
            let _ = writeln!(
                out,
                "  {{cmd:{},arg1:{},arg2:{},blen1:{},blen:{}}}",
                h.opcode, h.arg1, h.arg2, h.secondary_len, h.primary_len
            );
        }
        out.push_str(if omitted { "  <more cmds be omitted>" } else { "  {NULL}" });
        out
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("session", &self.session.as_ref().map(|s| s.name().to_string()))
            .field("batch", &self.batch.len())
            .field("timeout", &self.timeout)
            .field("last_status", &self.last_status)
            .finish()
    }
}

/// One client connection.
#[derive(Debug)]
pub struct Connection {
    inbox: Inbox,
    ctx: Context,
}

impl Connection {
    /// Wraps an accepted socket.
    pub fn new(stream: Stream, stats: Arc<ServerStats>, config: &ConnectionConfig) -> Self {
        stats.connection_opened();
        let fd = stream.as_raw_fd();
        let peer = stream.peer();
        Self {
            inbox: Inbox::new(config.buffer_size, config.max_body),
            ctx: Context {
                stream,
                fd,
                peer,
                outbox: BytesMut::with_capacity(config.buffer_size),
                out_capacity: config.buffer_size,
                batch: Batch::default(),
                session: None,
                search: None,
                timeout: config.idle_timeout,
                last_status: 0,
                buffered: 0,
                cancel: None,
                stats,
            },
        }
    }

    pub fn fd(&self) -> RawFd {
        self.ctx.fd
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    /// Reads once from the socket into the inbox.
    pub fn recv(&mut self) -> io::Result<usize> {
        let n = self.inbox.read_from(&mut self.ctx.stream)?;
        if n > 0 {
            self.ctx.stats.bytes_read(n);
            trace!(sock = self.ctx.fd, bytes = n, "data received");
        }
        Ok(n)
    }

    /// Runs every complete buffered command through the chain.
    ///
    /// Returns `Continue` when the buffer is exhausted, or the first other
    /// outcome. Responses are flushed before returning.
    pub fn parse(&mut self, chain: &Chain, mode: Option<&dyn Handler>) -> Outcome {
        let Connection { inbox, ctx } = self;
        ctx.buffered = inbox.len();

        let parsed = inbox.parse(|cmd| match chain.exec(ctx, cmd, mode) {
            Outcome::Continue => ControlFlow::Continue(()),
            other => ControlFlow::Break(other),
        });

        let mut outcome = match parsed {
            Ok(Some(outcome)) => outcome,
            Ok(None) => Outcome::Continue,
            Err(FrameError::TooLarge { size, max }) => {
                warn!(sock = ctx.fd, size, max, "frame too large");
                let _ = ctx.respond(&Command::err(ErrorCode::TooLong));
                Outcome::Quit(QuitReason::Error)
            }
            Err(FrameError::NoMemory(size)) => {
                warn!(sock = ctx.fd, size, "unable to allocate memory for frame");
                Outcome::Quit(QuitReason::NoMemory)
            }
        };

        if outcome != Outcome::Quit(QuitReason::IoError) && ctx.flush().is_err() {
            outcome = Outcome::Quit(QuitReason::IoError);
        }
        outcome
    }

    /// Switches the socket to blocking reads and writes that give up after
    /// `slice`, for use on a pool thread. Sends stop retrying once `token`
    /// is cancelled.
    pub fn enter_blocking(&mut self, slice: Duration, token: &CancelToken) -> io::Result<()> {
        self.ctx.stream.set_nonblocking(false)?;
        self.ctx.stream.set_read_timeout(Some(slice))?;
        self.ctx.stream.set_write_timeout(Some(slice))?;
        self.ctx.cancel = Some(token.clone());
        Ok(())
    }

    /// Restores non-blocking mode before the connection returns to a loop.
    pub fn leave_blocking(&mut self) -> io::Result<()> {
        self.ctx.cancel = None;
        self.ctx.stream.set_read_timeout(None)?;
        self.ctx.stream.set_write_timeout(None)?;
        self.ctx.stream.set_nonblocking(true)
    }

    /// Tears the connection down: logs the reason, flushes pending output
    /// (unless the socket already failed), drops buffers and closes.
    pub fn quit(mut self, reason: QuitReason) {
        let fd = self.ctx.fd;
        match reason {
            QuitReason::Closed | QuitReason::Normal => {
                info!(sock = fd, peer = %self.ctx.peer, "quit {}", reason)
            }
            QuitReason::Timeout => info!(
                sock = fd,
                timeout = self.ctx.timeout.map_or(0, |t| t.as_secs()),
                "quit for io timeout"
            ),
            QuitReason::Error => warn!(
                sock = fd,
                code = self.ctx.last_status,
                "quit for error code"
            ),
            _ => warn!(sock = fd, "quit for {}", reason),
        }

        if reason != QuitReason::IoError {
            let _ = self.ctx.flush();
        }
        self.inbox.clear();
        self.ctx.batch.clear();
        self.ctx.search = None;
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.ctx.fd
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.ctx.stats.connection_closed();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connection::chain::HandlerTable;
    use crate::protocol::{ok, Header, HEADER_LEN};
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    /// A connection over one end of a socket pair, plus the client end.
    pub(crate) fn pair(stats: Arc<ServerStats>) -> (Connection, UnixStream) {
        let (server, client) = UnixStream::pair().unwrap();
        let conn = Connection::new(Stream::Unix(server), stats, &ConnectionConfig::default());
        (conn, client)
    }

    /// Reads exactly one frame from the client end.
    pub(crate) fn read_frame(client: &mut UnixStream) -> Command<'static> {
        let mut header = [0u8; HEADER_LEN];
        client.read_exact(&mut header).unwrap();
        let header = Header::decode(&header).unwrap();
        let mut body = vec![0u8; header.body_len()];
        client.read_exact(&mut body).unwrap();
        Command::owned(header, body)
    }

    #[test]
    fn test_stats_track_lifetime() {
        let stats = Arc::new(ServerStats::new());
        let (conn, _client) = pair(Arc::clone(&stats));
        assert_eq!(stats.active(), 1);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);

        conn.quit(QuitReason::Normal);
        assert_eq!(stats.active(), 0);
    }

    #[test]
    fn test_respond_and_flush() {
        let stats = Arc::new(ServerStats::new());
        let (mut conn, mut client) = pair(Arc::clone(&stats));

        let verdict = conn.context_mut().reply_ok(201, "demo");
        assert_eq!(verdict, Verdict::cont());
        conn.context_mut().flush().unwrap();

        let frame = read_frame(&mut client);
        assert_eq!(frame.opcode(), opcode::OK);
        assert_eq!(frame.arg(), 201);
        assert_eq!(frame.primary(), b"demo");
        assert_eq!(conn.context().last_status(), 201);
        assert!(stats.bytes_written.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_large_response_passes_through() {
        let stats = Arc::new(ServerStats::new());
        let (mut conn, mut client) = pair(stats);

        let payload = vec![7u8; 3000];
        let writer = std::thread::spawn(move || {
            conn.context_mut()
                .respond(&Command::new(opcode::SEARCH_RESULT_FIELD, 1, payload))
                .unwrap();
            conn.context_mut().flush().unwrap();
            conn
        });

        let frame = read_frame(&mut client);
        assert_eq!(frame.primary().len(), 3000);
        writer.join().unwrap().quit(QuitReason::Normal);
    }

    #[test]
    fn test_quit_closes_socket() {
        let stats = Arc::new(ServerStats::new());
        let (conn, mut client) = pair(stats);

        conn.quit(QuitReason::Closed);
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_timeout_setting() {
        let stats = Arc::new(ServerStats::new());
        let (mut conn, _client) = pair(stats);

        conn.context_mut().set_timeout_secs(0);
        assert_eq!(conn.context().timeout(), None);
        conn.context_mut().set_timeout_secs(30);
        assert_eq!(conn.context().timeout(), Some(Duration::from_secs(30)));
    }

    fn unhandled(_: &mut Context, _: &Command<'_>) -> Verdict {
        Verdict::next()
    }

    #[test]
    fn test_oversized_frame_answers_too_long() {
        let stats = Arc::new(ServerStats::new());
        let (server, mut client) = UnixStream::pair().unwrap();
        let config = ConnectionConfig {
            max_body: 1000,
            ..Default::default()
        };
        let mut conn = Connection::new(Stream::Unix(server), Arc::clone(&stats), &config);
        let table = HandlerTable::new().on(opcode::TIMEOUT, |ctx: &mut Context, cmd: &Command<'_>| {
            ctx.set_timeout_secs(cmd.arg());
            ctx.reply_ok(ok::TIMEOUT_SET, "")
        });
        let chain = Chain::new(Arc::new(table), Arc::new(unhandled));

        // a valid command, then a header announcing a body over the limit
        let mut wire = BytesMut::new();
        Command::empty(opcode::TIMEOUT, 7).encode(&mut wire);
        Header::new(opcode::QUERY_PARSE, 0, 4096, 0).encode(&mut wire);
        client.write_all(&wire).unwrap();

        assert!(conn.recv().unwrap() > 0);
        assert_eq!(conn.parse(&chain, None), Outcome::Quit(QuitReason::Error));
        assert_eq!(conn.context().last_status(), ErrorCode::TooLong.code());
        assert_eq!(conn.context().timeout(), Some(Duration::from_secs(7)));
        assert!(conn.context().batch().is_empty());

        assert_eq!(read_frame(&mut client).arg(), ok::TIMEOUT_SET);
        let frame = read_frame(&mut client);
        assert_eq!(frame.opcode(), opcode::ERR);
        assert_eq!(frame.arg(), ErrorCode::TooLong.code());

        conn.quit(QuitReason::Error);
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert_eq!(stats.active(), 0);
    }

    #[test]
    fn test_batch_keeps_order() {
        let mut batch = Batch::default();
        batch.push(Command::empty(opcode::QUERY_INIT, 0)).unwrap();
        batch.push(Command::new(opcode::QUERY_PARSE, 0, "a")).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.pop_front().unwrap().opcode(), opcode::QUERY_INIT);
        assert_eq!(batch.pop_front().unwrap().opcode(), opcode::QUERY_PARSE);
        assert!(batch.is_empty());
    }
}
