//! Search Commands
//!
//! Two handlers split the work of a search transaction between the event
//! loop and the pool:
//!
//! ```text
//!  event loop (worker_table)             pool thread (TaskHandler)
//!  ─────────────────────────             ─────────────────────────
//!  SET_SORT, QUERY_PARSE, ... → SAVE     batch replayed in order
//!  GET_RESULT, GET_TOTAL, ... → SAVE     ├─ each command → SearchContext
//!                               + PAUSE  ├─ frames written back
//!                                        └─ further commands read directly
//!                                           FINISH → OK 209, back to loop
//! ```
//!
//! Setting commands are only collected on the event loop; the first command
//! that needs the index pauses the connection and hands the whole batch to
//! a pool thread, where a [`SearchContext`](crate::storage::SearchContext)
//! executes it.

use crate::connection::{Context, Handler, HandlerTable, QuitReason, Verdict};
use crate::pool::ThreadPool;
use crate::protocol::{ok, opcode, Command, ErrorCode};
use crate::storage::Response;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Commands that need the index: saved, then the connection is paused.
pub const PAUSE_COMMANDS: &[u8] = &[
    opcode::SEARCH_DB_TOTAL,
    opcode::SEARCH_GET_TOTAL,
    opcode::SEARCH_GET_RESULT,
    opcode::SEARCH_GET_SYNONYMS,
    opcode::QUERY_GET_STRING,
    opcode::QUERY_GET_TERMS,
    opcode::QUERY_GET_CORRECTED,
    opcode::QUERY_GET_EXPANDED,
    opcode::SEARCH_SET_DB,
    opcode::SEARCH_ADD_DB,
    opcode::SEARCH_GET_DB,
];

/// Query and search settings: saved for the next pool task.
pub const SAVE_COMMANDS: &[u8] = &[
    opcode::SEARCH_SET_SORT,
    opcode::SEARCH_SET_CUT,
    opcode::SEARCH_SET_NUMERIC,
    opcode::SEARCH_SET_COLLAPSE,
    opcode::SEARCH_SET_FACETS,
    opcode::SEARCH_SET_CUTOFF,
    opcode::SEARCH_SET_MISC,
    opcode::QUERY_INIT,
    opcode::QUERY_PARSE,
    opcode::QUERY_TERM,
    opcode::QUERY_TERMS,
    opcode::QUERY_RANGEPROC,
    opcode::QUERY_RANGE,
    opcode::QUERY_VALCMP,
    opcode::QUERY_PREFIX,
    opcode::QUERY_PARSEFLAG,
];

/// The server-wide handler table of a worker process.
///
/// `keepalive` is the process-wide flag toggled by `SEARCH_KEEPALIVE`; the
/// reaper leaves long tasks alone while it is set.
pub fn worker_table(pool: Arc<ThreadPool>, keepalive: Arc<AtomicBool>) -> HandlerTable {
    HandlerTable::new()
        .on_each(PAUSE_COMMANDS, |_: &mut Context, _: &Command<'_>| {
            Verdict::pause().and_save()
        })
        .on_each(SAVE_COMMANDS, |_: &mut Context, _: &Command<'_>| {
            Verdict::cont().and_save()
        })
        .on_each(
            &[opcode::SEARCH_FINISH, opcode::SEARCH_ADD_LOG],
            |ctx: &mut Context, _: &Command<'_>| ctx.reply_err(ErrorCode::WrongPlace),
        )
        .on(
            opcode::SEARCH_KEEPALIVE,
            move |ctx: &mut Context, cmd: &Command<'_>| {
                let on = cmd.arg1() != 0;
                keepalive.store(on, Ordering::Relaxed);
                info!(sock = ctx.fd(), on, "keep-alive flag changed");
                Verdict::cont()
            },
        )
        .on(
            opcode::SEARCH_DRAW_TPOOL,
            move |ctx: &mut Context, _: &Command<'_>| ctx.reply_ok(ok::INFO, pool.draw()),
        )
}

/// The mode handler used on pool threads: executes commands against the
/// connection's search context.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskHandler;

impl TaskHandler {
    fn execute(&self, ctx: &mut Context, cmd: &Command<'_>) -> Verdict {
        let Some(search) = ctx.search_mut() else {
            return Verdict::next();
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| search.execute(cmd)));
        match result {
            Ok(Ok(Response::Frames(frames))) => {
                for frame in &frames {
                    if let Err(e) = ctx.respond(frame) {
                        debug!(sock = ctx.fd(), error = %e, "failed to send search result");
                        return Verdict::quit(QuitReason::IoError);
                    }
                }
                Verdict::cont()
            }
            Ok(Ok(Response::Unhandled)) => Verdict::unimplemented(),
            Ok(Err(e)) => {
                error!(sock = ctx.fd(), opcode = opcode::name(cmd.opcode()), error = %e, "search backend error");
                let verdict = ctx.reply(Command::err_with(e.code(), e.to_string()));
                if verdict.outcome.is_quit() {
                    verdict
                } else {
                    Verdict::quit(QuitReason::Error)
                }
            }
            Err(_) => {
                error!(sock = ctx.fd(), opcode = opcode::name(cmd.opcode()), "search backend panicked");
                let verdict = ctx.reply_err(ErrorCode::Unknown);
                if verdict.outcome.is_quit() {
                    verdict
                } else {
                    Verdict::quit(QuitReason::Error)
                }
            }
        }
    }
}

impl Handler for TaskHandler {
    fn handle(&self, ctx: &mut Context, cmd: &Command<'_>) -> Verdict {
        match cmd.opcode() {
            opcode::SEARCH_FINISH => {
                debug!(sock = ctx.fd(), "search transaction finished");
                let verdict = ctx.reply_ok(ok::FINISHED, Vec::new());
                if verdict.outcome.is_quit() {
                    verdict
                } else {
                    Verdict::pause()
                }
            }
            opcode::USE => ctx.reply_err(ErrorCode::WrongPlace),
            opcode::DEBUG
            | opcode::TIMEOUT
            | opcode::QUIT
            | opcode::SEARCH_KEEPALIVE
            | opcode::SEARCH_DRAW_TPOOL => Verdict::next(),
            _ => self.execute(ctx, cmd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::connection::handler::tests::{pair, read_frame};
    use crate::connection::{Chain, Outcome, ServerStats};
    use crate::session::SessionRegistry;
    use crate::storage::{Backend, BackendError, Document, MemoryBackend, SearchContext};

    struct Fixture {
        _dir: tempfile::TempDir,
        chain: Chain,
        keepalive: Arc<AtomicBool>,
        registry: Arc<SessionRegistry>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::new(dir.path(), 8));
        let pool = Arc::new(ThreadPool::new(PoolConfig {
            max_total: 1,
            min_spare: 1,
            max_spare: 1,
        }));
        let keepalive = Arc::new(AtomicBool::new(false));
        let chain = Chain::new(
            Arc::new(worker_table(pool, Arc::clone(&keepalive))),
            Arc::new(crate::commands::UniversalHandler::new(Arc::clone(&registry))),
        );
        Fixture {
            _dir: dir,
            chain,
            keepalive,
            registry,
        }
    }

    #[test]
    fn test_settings_saved_until_pause() {
        let fx = fixture();
        let (mut conn, _client) = pair(Arc::new(ServerStats::new()));
        let ctx = conn.context_mut();
        ctx.set_session(fx.registry.open(b"demo", b"").unwrap());

        let steps = [
            (Command::empty(opcode::QUERY_INIT, 0), Outcome::Continue),
            (Command::new(opcode::QUERY_PARSE, 0, "hello"), Outcome::Continue),
            (Command::empty(opcode::SEARCH_SET_SORT, 1), Outcome::Continue),
            (Command::empty(opcode::SEARCH_GET_TOTAL, 0), Outcome::Pause),
        ];
        for (cmd, expected) in steps {
            assert_eq!(fx.chain.exec(ctx, cmd, None), expected);
        }

        let ops: Vec<u8> = ctx.batch().iter().map(|c| c.opcode()).collect();
        assert_eq!(
            ops,
            [
                opcode::QUERY_INIT,
                opcode::QUERY_PARSE,
                opcode::SEARCH_SET_SORT,
                opcode::SEARCH_GET_TOTAL
            ]
        );
        assert_eq!(ctx.last_status(), 0);
    }

    #[test]
    fn test_finish_on_event_loop_is_wrong_place() {
        let fx = fixture();
        let (mut conn, mut client) = pair(Arc::new(ServerStats::new()));
        let ctx = conn.context_mut();
        ctx.set_session(fx.registry.open(b"demo", b"").unwrap());

        assert_eq!(fx.chain.exec(ctx, Command::empty(opcode::SEARCH_FINISH, 0), None), Outcome::Continue);
        ctx.flush().unwrap();
        assert_eq!(read_frame(&mut client).arg(), ErrorCode::WrongPlace.code());
    }

    #[test]
    fn test_keepalive_and_draw() {
        let fx = fixture();
        let (mut conn, mut client) = pair(Arc::new(ServerStats::new()));
        let ctx = conn.context_mut();
        ctx.set_session(fx.registry.open(b"demo", b"").unwrap());

        let on = Command::owned(crate::protocol::Header::new(opcode::SEARCH_KEEPALIVE, 0x0100, 0, 0), Vec::new());
        assert_eq!(fx.chain.exec(ctx, on, None), Outcome::Continue);
        assert!(fx.keepalive.load(Ordering::Relaxed));
        fx.chain.exec(ctx, Command::empty(opcode::SEARCH_KEEPALIVE, 0), None);
        assert!(!fx.keepalive.load(Ordering::Relaxed));

        fx.chain.exec(ctx, Command::empty(opcode::SEARCH_DRAW_TPOOL, 0), None);
        ctx.flush().unwrap();
        let dump = read_frame(&mut client);
        assert_eq!(dump.arg(), ok::INFO);
        assert!(dump.primary_str().starts_with("TPOOL"));
    }

    #[test]
    fn test_task_handler_runs_backend() {
        let fx = fixture();
        let backend = MemoryBackend::new(16);
        backend.insert("demo", "db", Document::new(1, "hello world"));
        backend.insert("demo", "db", Document::new(2, "hello again"));

        let (mut conn, mut client) = pair(Arc::new(ServerStats::new()));
        let ctx = conn.context_mut();
        let session = fx.registry.open(b"demo", b"").unwrap();
        ctx.set_search(Some(backend.open(&session).unwrap()));
        ctx.set_session(session);

        let task = TaskHandler;
        let mode: Option<&dyn Handler> = Some(&task);
        assert_eq!(fx.chain.exec(ctx, Command::new(opcode::QUERY_PARSE, 0, "hello"), mode), Outcome::Continue);
        assert_eq!(fx.chain.exec(ctx, Command::empty(opcode::SEARCH_GET_TOTAL, 0), mode), Outcome::Continue);
        assert_eq!(fx.chain.exec(ctx, Command::empty(opcode::SEARCH_FINISH, 0), mode), Outcome::Pause);
        ctx.flush().unwrap();

        let total = read_frame(&mut client);
        assert_eq!(total.arg(), ok::SEARCH_TOTAL);
        assert_eq!(total.primary(), &2u32.to_le_bytes());
        assert_eq!(read_frame(&mut client).arg(), ok::FINISHED);
        assert!(ctx.batch().is_empty());
    }

    struct Broken;

    impl SearchContext for Broken {
        fn execute(&mut self, cmd: &Command<'_>) -> Result<Response, BackendError> {
            match cmd.opcode() {
                opcode::SEARCH_GET_TOTAL => Err(BackendError::Query("index corrupted".into())),
                _ => panic!("unexpected command"),
            }
        }

        fn databases(&self) -> Vec<String> {
            Vec::new()
        }
    }

    #[test]
    fn test_backend_failures_end_the_session() {
        let fx = fixture();
        let (mut conn, mut client) = pair(Arc::new(ServerStats::new()));
        let ctx = conn.context_mut();
        ctx.set_session(fx.registry.open(b"demo", b"").unwrap());
        ctx.set_search(Some(Box::new(Broken)));
        let mode: Option<&dyn Handler> = Some(&TaskHandler);

        let out = fx.chain.exec(ctx, Command::empty(opcode::SEARCH_GET_TOTAL, 0), mode);
        assert_eq!(out, Outcome::Quit(QuitReason::Error));
        let out = fx.chain.exec(ctx, Command::empty(opcode::SEARCH_GET_RESULT, 0), mode);
        assert_eq!(out, Outcome::Quit(QuitReason::Error));
        ctx.flush().unwrap();

        let first = read_frame(&mut client);
        assert_eq!(first.arg(), ErrorCode::Backend.code());
        assert!(first.primary_str().contains("index corrupted"));
        assert_eq!(read_frame(&mut client).arg(), ErrorCode::Unknown.code());
    }

    #[test]
    fn test_use_inside_task_is_wrong_place() {
        let fx = fixture();
        let (mut conn, mut client) = pair(Arc::new(ServerStats::new()));
        let ctx = conn.context_mut();
        ctx.set_session(fx.registry.open(b"demo", b"").unwrap());

        let mode: Option<&dyn Handler> = Some(&TaskHandler);
        let out = fx.chain.exec(ctx, Command::new(opcode::USE, 0, "other"), mode);
        assert_eq!(out, Outcome::Continue);
        ctx.flush().unwrap();
        assert_eq!(read_frame(&mut client).arg(), ErrorCode::WrongPlace.code());
    }
}
