//! Dispatch Chain
//!
//! Every decoded command walks an ordered chain of handlers until one of
//! them claims it (returns anything other than `Next`):
//!
//! ```text
//!   Command
//!      │
//!      ▼
//! ┌─────────────────┐  no session yet and not USE/QUIT/TIMEOUT
//! │ 1. session gate │────────────────────────────► ERR 401 (or silence)
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐  supplied per call: the task handler on pool
//! │ 2. mode handler │  threads, nothing on the event loop
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐  server-wide table: first matching opcode or
//! │ 3. server table │  the wildcard entry
//! └────────┬────────┘
//!          ▼
//! ┌─────────────────┐  USE, DEBUG, TIMEOUT, QUIT
//! │ 4. post-check   │
//! └────────┬────────┘
//!          ▼
//!   SAVE? → copy (borrowed) or move (spillover) into the batch
//!   Unimplemented / Next → ERR 505 (or silence)
//! ```

use crate::connection::handler::Context;
use crate::connection::outcome::{Outcome, QuitReason, Verdict};
use crate::protocol::{opcode, Command, ErrorCode};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// One link of the dispatch chain.
pub trait Handler: Send + Sync {
    /// Handles `cmd`, or returns `Verdict::next()` to defer to the next link.
    fn handle(&self, ctx: &mut Context, cmd: &Command<'_>) -> Verdict;
}

impl<F> Handler for F
where
    F: Fn(&mut Context, &Command<'_>) -> Verdict + Send + Sync,
{
    fn handle(&self, ctx: &mut Context, cmd: &Command<'_>) -> Verdict {
        self(ctx, cmd)
    }
}

/// Opcode → handler table. The first entry whose opcode matches, or whose
/// opcode is [`opcode::DEFAULT`], handles the command.
#[derive(Clone, Default)]
pub struct HandlerTable {
    entries: Vec<(u8, Arc<dyn Handler>)>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes one opcode to `handler`.
    pub fn on(mut self, op: u8, handler: impl Handler + 'static) -> Self {
        self.entries.push((op, Arc::new(handler)));
        self
    }

    /// Routes several opcodes to the same handler.
    pub fn on_each(mut self, ops: &[u8], handler: impl Handler + 'static) -> Self {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        self.entries
            .extend(ops.iter().map(|&op| (op, Arc::clone(&handler))));
        self
    }

    /// Adds the wildcard entry. Entries after it are never reached.
    pub fn fallback(mut self, handler: impl Handler + 'static) -> Self {
        self.entries.push((opcode::DEFAULT, Arc::new(handler)));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Handler for HandlerTable {
    fn handle(&self, ctx: &mut Context, cmd: &Command<'_>) -> Verdict {
        self.entries
            .iter()
            .find(|(op, _)| *op == cmd.opcode() || *op == opcode::DEFAULT)
            .map_or(Verdict::next(), |(_, handler)| handler.handle(ctx, cmd))
    }
}

/// Rejects commands issued before a project has been selected.
pub fn session_gate(ctx: &mut Context, cmd: &Command<'_>) -> Verdict {
    if ctx.session().is_some() {
        return Verdict::next();
    }
    match cmd.opcode() {
        opcode::USE | opcode::QUIT | opcode::TIMEOUT => Verdict::next(),
        op => {
            debug!(sock = ctx.fd(), opcode = opcode::name(op), "do not specify a project");
            if cmd.is_silent() {
                Verdict::cont()
            } else {
                ctx.reply_err(ErrorCode::NoProject)
            }
        }
    }
}

/// The full chain minus the per-call mode handler.
#[derive(Clone)]
pub struct Chain {
    server: Arc<dyn Handler>,
    post: Arc<dyn Handler>,
}

impl Chain {
    /// Builds a chain from the server-wide table and the post-check handler.
    pub fn new(server: Arc<dyn Handler>, post: Arc<dyn Handler>) -> Self {
        Self { server, post }
    }

    /// Dispatches one command and resolves SAVE and unimplemented outcomes.
    pub fn exec(&self, ctx: &mut Context, cmd: Command<'_>, mode: Option<&dyn Handler>) -> Outcome {
        ctx.stats().command_processed();
        let op = cmd.opcode();
        let silent = cmd.is_silent();
        trace!(
            sock = ctx.fd(),
            opcode = opcode::name(op),
            arg = cmd.arg(),
            len = cmd.header.body_len(),
            "dispatching command"
        );

        let mut verdict = session_gate(ctx, &cmd);
        if verdict.outcome == Outcome::Next {
            if let Some(mode) = mode {
                verdict = mode.handle(ctx, &cmd);
            }
        }
        if verdict.outcome == Outcome::Next {
            verdict = self.server.handle(ctx, &cmd);
        }
        if verdict.outcome == Outcome::Next {
            verdict = self.post.handle(ctx, &cmd);
        }

        let mut outcome = verdict.outcome;
        if verdict.save && !outcome.is_quit() {
            let saved = cmd
                .into_owned()
                .ok()
                .and_then(|owned| ctx.batch_mut().push(owned).ok());
            if saved.is_none() {
                warn!(sock = ctx.fd(), opcode = opcode::name(op), "unable to save command");
                return Outcome::Quit(QuitReason::NoMemory);
            }
            trace!(sock = ctx.fd(), batch = ctx.batch().len(), "command saved");
            if matches!(outcome, Outcome::Next | Outcome::Unimplemented) {
                outcome = Outcome::Continue;
            }
        }

        match outcome {
            Outcome::Next | Outcome::Unimplemented => {
                debug!(sock = ctx.fd(), opcode = op, "command not implemented");
                if silent {
                    Outcome::Continue
                } else {
                    ctx.reply_err(ErrorCode::Unimplemented).outcome
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::handler::tests::{pair, read_frame};
    use crate::connection::handler::ServerStats;
    use crate::session::SessionRegistry;

    fn never(_: &mut Context, _: &Command<'_>) -> Verdict {
        Verdict::next()
    }

    fn chain_with(server: HandlerTable) -> Chain {
        Chain::new(Arc::new(server), Arc::new(never))
    }

    fn with_session(ctx: &mut Context) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path(), 4);
        ctx.set_session(registry.open(b"demo", b"").unwrap());
        dir
    }

    #[test]
    fn test_gate_rejects_without_session() {
        let (mut conn, mut client) = pair(Arc::new(ServerStats::new()));
        let chain = chain_with(HandlerTable::new());

        let out = chain.exec(
            conn.context_mut(),
            Command::empty(opcode::SEARCH_GET_TOTAL, 0),
            None,
        );
        assert_eq!(out, Outcome::Continue);
        conn.context_mut().flush().unwrap();

        let frame = read_frame(&mut client);
        assert_eq!(frame.opcode(), opcode::ERR);
        assert_eq!(frame.arg(), ErrorCode::NoProject.code());
    }

    #[test]
    fn test_gate_silent_without_session() {
        let (mut conn, _client) = pair(Arc::new(ServerStats::new()));
        let chain = chain_with(HandlerTable::new());

        let out = chain.exec(
            conn.context_mut(),
            Command::empty(opcode::SEARCH_SET_SORT, 0),
            None,
        );
        assert_eq!(out, Outcome::Continue);
        assert_eq!(conn.context().last_status(), 0);
    }

    #[test]
    fn test_table_first_match_and_wildcard() {
        let (mut conn, _client) = pair(Arc::new(ServerStats::new()));
        let _dir = with_session(conn.context_mut());
        let table = HandlerTable::new()
            .on(opcode::SEARCH_FINISH, |_: &mut Context, _: &Command<'_>| Verdict::pause())
            .fallback(|_: &mut Context, _: &Command<'_>| Verdict::quit(QuitReason::Other));
        let chain = chain_with(table);

        let out = chain.exec(conn.context_mut(), Command::empty(opcode::SEARCH_FINISH, 0), None);
        assert_eq!(out, Outcome::Pause);
        let out = chain.exec(conn.context_mut(), Command::empty(opcode::DEBUG, 0), None);
        assert_eq!(out, Outcome::Quit(QuitReason::Other));
    }

    #[test]
    fn test_mode_handler_runs_before_table() {
        let (mut conn, _client) = pair(Arc::new(ServerStats::new()));
        let _dir = with_session(conn.context_mut());
        let table = HandlerTable::new().fallback(|_: &mut Context, _: &Command<'_>| Verdict::pause());
        let chain = chain_with(table);
        let mode = |_: &mut Context, _: &Command<'_>| Verdict::quit(QuitReason::Normal);

        let out = chain.exec(conn.context_mut(), Command::empty(opcode::QUIT, 0), Some(&mode));
        assert_eq!(out, Outcome::Quit(QuitReason::Normal));
    }

    #[test]
    fn test_save_copies_borrowed_command() {
        let (mut conn, _client) = pair(Arc::new(ServerStats::new()));
        let _dir = with_session(conn.context_mut());
        let table = HandlerTable::new().fallback(|_: &mut Context, _: &Command<'_>| Verdict::next().and_save());
        let chain = chain_with(table);

        let raw = Command::new(opcode::QUERY_PARSE, 0, "hello");
        let mut wire = bytes::BytesMut::new();
        raw.encode(&mut wire);
        let header = crate::protocol::Header::decode(&wire).unwrap();
        let borrowed = Command::borrowed(header, &wire[crate::protocol::HEADER_LEN..]);

        let out = chain.exec(conn.context_mut(), borrowed, None);
        drop(wire);
        assert_eq!(out, Outcome::Continue);
        let saved = conn.context_mut().batch_mut().pop_front().unwrap();
        assert_eq!(saved.primary(), b"hello");
        assert!(!saved.is_borrowed());
    }

    #[test]
    fn test_unimplemented_answers_error() {
        let (mut conn, mut client) = pair(Arc::new(ServerStats::new()));
        let _dir = with_session(conn.context_mut());
        let chain = chain_with(HandlerTable::new());

        let out = chain.exec(conn.context_mut(), Command::empty(opcode::QUERY_GET_EXPANDED, 0), None);
        assert_eq!(out, Outcome::Continue);
        conn.context_mut().flush().unwrap();
        assert_eq!(read_frame(&mut client).arg(), ErrorCode::Unimplemented.code());

        // silent opcodes are never answered
        let out = chain.exec(conn.context_mut(), Command::empty(opcode::QUERY_PREFIX, 0), None);
        assert_eq!(out, Outcome::Continue);
        assert_eq!(conn.context().last_status(), ErrorCode::Unimplemented.code());
    }
}
