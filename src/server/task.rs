//! Connection Task
//!
//! A paused connection travels to a pool thread inside a
//! [`ConnectionTask`]. There it runs one search transaction:
//!
//! ```text
//!  open SearchContext for the session
//!        │
//!        ▼
//!  replay the batch in arrival order ───────────┐ any non-Continue ends
//!        │                                      │ the task early
//!        ▼                                      │
//!  flush, then read more commands directly      │
//!  from the socket in short blocking slices ────┤
//!        │                                      ▼
//!        ├── FINISH → Pause ──► push back to the event loop
//!        ├── Quit(..)       ──► close the connection here
//!        └── token tripped  ──► Cancelled (cleanup: ERR 514, close)
//! ```
//!
//! The cancel token is checked between batch commands and between socket
//! read slices. A send stuck behind a client that stopped reading gives up
//! one slice after the token trips, so a timed-out task always stops.

use crate::commands::TaskHandler;
use crate::connection::{Connection, Handler, Outcome, QuitReason};
use crate::pool::{CancelToken, Task, TaskStatus};
use crate::protocol::{Command, ErrorCode};
use crate::server::event_loop::Services;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest a blocking socket read or write on a pool thread waits before
/// the task re-checks its cancel token.
pub const READ_SLICE: Duration = Duration::from_millis(100);

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    Paused,
    Quit(QuitReason),
    Cancelled,
}

/// A paused connection running its transaction on a pool thread.
pub struct ConnectionTask {
    conn: Option<Connection>,
    services: Arc<Services>,
}

impl ConnectionTask {
    pub fn new(conn: Connection, services: Arc<Services>) -> Self {
        Self {
            conn: Some(conn),
            services,
        }
    }

    fn run(&self, conn: &mut Connection, token: &CancelToken) -> End {
        if let Err(e) = conn.enter_blocking(READ_SLICE, token) {
            warn!(sock = conn.fd(), error = %e, "failed to switch socket to blocking mode");
            return End::Quit(QuitReason::IoError);
        }

        let Some(session) = conn.context().session().cloned() else {
            return End::Quit(QuitReason::Error);
        };
        match self.services.backend.open(&session) {
            Ok(search) => conn.context_mut().set_search(Some(search)),
            Err(e) => {
                error!(sock = conn.fd(), project = session.name(), error = %e, "failed to open search context");
                let _ = conn.context_mut().respond(&Command::err_with(e.code(), e.to_string()));
                return End::Quit(QuitReason::Error);
            }
        }

        let mode = TaskHandler;
        let mode: Option<&dyn Handler> = Some(&mode);
        info!(sock = conn.fd(), batch = conn.context().batch().len(), "task begin");

        while let Some(cmd) = conn.context_mut().batch_mut().pop_front() {
            if token.is_cancelled() {
                return End::Cancelled;
            }
            match self.services.chain.exec(conn.context_mut(), cmd, mode) {
                Outcome::Quit(reason) => return End::Quit(reason),
                Outcome::Pause => return End::Paused,
                _ => {}
            }
        }
        if conn.context_mut().flush().is_err() {
            return End::Quit(QuitReason::IoError);
        }

        let idle = conn.context().timeout();
        let mut last_data = Instant::now();
        loop {
            if token.is_cancelled() {
                return End::Cancelled;
            }
            match conn.parse(&self.services.chain, mode) {
                Outcome::Quit(reason) => return End::Quit(reason),
                Outcome::Pause => return End::Paused,
                _ => {}
            }

            loop {
                if token.is_cancelled() {
                    return End::Cancelled;
                }
                match conn.recv() {
                    Ok(0) => return End::Quit(QuitReason::Closed),
                    Ok(_) => {
                        last_data = Instant::now();
                        break;
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                        ) =>
                    {
                        if idle.is_some_and(|t| last_data.elapsed() >= t) {
                            return End::Quit(QuitReason::Timeout);
                        }
                    }
                    Err(e) => {
                        debug!(sock = conn.fd(), error = %e, "read failed in task");
                        return End::Quit(QuitReason::IoError);
                    }
                }
            }
        }
    }
}

impl Task for ConnectionTask {
    fn execute(&mut self, token: &CancelToken) -> TaskStatus {
        let Some(mut conn) = self.conn.take() else {
            return TaskStatus::Finished;
        };

        // a send abandoned for the token counts as a cancellation
        let end = match self.run(&mut conn, token) {
            End::Quit(QuitReason::IoError) if token.is_cancelled() => End::Cancelled,
            end => end,
        };
        info!(sock = conn.fd(), end = ?end, "task end");
        match end {
            End::Paused => {
                let ctx = conn.context_mut();
                ctx.set_search(None);
                ctx.batch_mut().clear();
                if ctx.flush().is_err() {
                    if token.is_cancelled() {
                        self.conn = Some(conn);
                        return TaskStatus::Cancelled;
                    }
                    conn.quit(QuitReason::IoError);
                } else if let Err(e) = conn.leave_blocking() {
                    warn!(sock = conn.fd(), error = %e, "failed to restore non-blocking mode");
                    conn.quit(QuitReason::IoError);
                } else {
                    self.services.handoff.push_back(conn);
                }
                TaskStatus::Finished
            }
            End::Quit(reason) => {
                conn.quit(reason);
                TaskStatus::Finished
            }
            End::Cancelled => {
                self.conn = Some(conn);
                TaskStatus::Cancelled
            }
        }
    }

    fn cancel(self: Box<Self>) {
        let Some(mut conn) = self.conn else { return };
        warn!(sock = conn.fd(), "task canceled, run cleanup");
        let ctx = conn.context_mut();
        ctx.set_search(None);
        ctx.batch_mut().clear();
        let _ = ctx.respond(&Command::err(ErrorCode::TaskCanceled));
        conn.quit(QuitReason::Error);
    }

    fn label(&self) -> String {
        match &self.conn {
            Some(conn) => format!("sock:{}", conn.fd()),
            None => "sock:-".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::handler::tests::{pair, read_frame};
    use crate::connection::ServerStats;
    use crate::protocol::{ok, opcode};
    use crate::server::event_loop::tests::services;
    use crate::server::handoff::PipeMessage;
    use crate::storage::{Document, MemoryBackend};
    use bytes::BytesMut;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    fn wire(cmds: &[Command<'static>]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for cmd in cmds {
            cmd.encode(&mut buf);
        }
        buf.to_vec()
    }

    fn paused_conn(services: &Arc<Services>) -> (Connection, UnixStream) {
        let (mut conn, client) = pair(Arc::clone(&services.stats));
        let ctx = conn.context_mut();
        ctx.set_session(services.sessions.open(b"demo", b"").unwrap());
        ctx.batch_mut().push(Command::new(opcode::QUERY_PARSE, 0, "hello")).unwrap();
        ctx.batch_mut().push(Command::empty(opcode::SEARCH_GET_TOTAL, 0)).unwrap();
        (conn, client)
    }

    fn backend() -> MemoryBackend {
        let backend = MemoryBackend::new(16);
        backend.insert("demo", "db", Document::new(1, "hello world"));
        backend
    }

    #[tokio::test]
    async fn test_transaction_then_push_back() {
        let dir = tempfile::tempdir().unwrap();
        let (services, mut pipe) = services(dir.path(), backend());
        let (conn, mut client) = paused_conn(&services);
        client.write_all(&wire(&[Command::empty(opcode::SEARCH_FINISH, 0)])).unwrap();

        let mut task = ConnectionTask::new(conn, Arc::clone(&services));
        let status = std::thread::spawn(move || task.execute(&CancelToken::new()))
            .join()
            .unwrap();
        assert_eq!(status, TaskStatus::Finished);

        let total = read_frame(&mut client);
        assert_eq!(total.arg(), ok::SEARCH_TOTAL);
        assert_eq!(read_frame(&mut client).arg(), ok::FINISHED);

        match pipe.recv().await {
            Some(PipeMessage::Resume(conn)) => {
                assert!(conn.context().batch().is_empty());
                assert!(conn.context().search().is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_task_answers_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let (services, _pipe) = services(dir.path(), backend());
        let (conn, mut client) = paused_conn(&services);

        let token = CancelToken::new();
        let tripper = token.clone();
        let mut task = Box::new(ConnectionTask::new(conn, Arc::clone(&services)));
        let handle = std::thread::spawn(move || {
            let status = task.execute(&token);
            (status, task)
        });
        std::thread::sleep(Duration::from_millis(250));
        tripper.cancel();

        let (status, task) = handle.join().unwrap();
        assert_eq!(status, TaskStatus::Cancelled);
        task.cancel();

        assert_eq!(read_frame(&mut client).arg(), ok::SEARCH_TOTAL);
        let frame = read_frame(&mut client);
        assert_eq!(frame.opcode(), opcode::ERR);
        assert_eq!(frame.arg(), ErrorCode::TaskCanceled.code());
        assert_eq!(services.stats.active(), 0);
    }

    #[test]
    fn test_cancel_interrupts_stalled_send() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new(16);
        let filler = "x".repeat(1 << 20);
        for id in 1..=8 {
            backend.insert("demo", "db", Document::new(id, format!("hello {filler}")));
        }
        let (services, _pipe) = services(dir.path(), backend);

        let (mut conn, _client) = pair(Arc::clone(&services.stats));
        let ctx = conn.context_mut();
        ctx.set_session(services.sessions.open(b"demo", b"").unwrap());
        ctx.batch_mut().push(Command::new(opcode::QUERY_PARSE, 0, "hello")).unwrap();
        ctx.batch_mut().push(Command::empty(opcode::SEARCH_GET_RESULT, 0)).unwrap();

        // the client never reads, so the result fills the socket buffer
        let token = CancelToken::new();
        let tripper = token.clone();
        let mut task = Box::new(ConnectionTask::new(conn, Arc::clone(&services)));
        let (done, finished) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let status = task.execute(&token);
            let _ = done.send((status, task));
        });
        std::thread::sleep(Duration::from_millis(300));
        tripper.cancel();

        let (status, task) = finished
            .recv_timeout(Duration::from_secs(3))
            .expect("task stuck in send after cancel");
        assert_eq!(status, TaskStatus::Cancelled);
        task.cancel();
        assert_eq!(services.stats.active(), 0);
    }

    #[test]
    fn test_client_close_ends_task() {
        let dir = tempfile::tempdir().unwrap();
        let (services, _pipe) = services(dir.path(), backend());
        let (conn, client) = paused_conn(&services);
        drop(client);

        let mut task = ConnectionTask::new(conn, Arc::clone(&services));
        assert_eq!(task.execute(&CancelToken::new()), TaskStatus::Finished);
        assert_eq!(services.stats.active(), 0);
    }

    #[test]
    fn test_task_without_session_quits() {
        let dir = tempfile::tempdir().unwrap();
        let (services, _pipe) = services(dir.path(), backend());
        let stats = Arc::new(ServerStats::new());
        let (conn, _client) = pair(Arc::clone(&stats));
        let mut task = ConnectionTask::new(conn, services);
        assert!(task.label().starts_with("sock:"));

        assert_eq!(task.execute(&CancelToken::new()), TaskStatus::Finished);
        assert_eq!(task.label(), "sock:-");
        assert_eq!(stats.active(), 0);
    }
}
