//! Universal Commands
//!
//! The last link of every dispatch chain. These commands work the same on
//! the event loop and on pool threads:
//!
//! - `USE name [home]`: select (and on first use create) a project
//! - `DEBUG`: dump the connection state as `OK 200`
//! - `TIMEOUT secs`: change the idle timeout, 0 disables it
//! - `QUIT`: close the connection

use crate::connection::{Context, Handler, QuitReason, Verdict};
use crate::protocol::{ok, opcode, Command};
use crate::session::SessionRegistry;
use std::sync::Arc;
use tracing::debug;

/// Handles `USE`, `DEBUG`, `TIMEOUT` and `QUIT`; defers everything else.
#[derive(Debug, Clone)]
pub struct UniversalHandler {
    registry: Arc<SessionRegistry>,
}

impl UniversalHandler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    fn use_project(&self, ctx: &mut Context, cmd: &Command<'_>) -> Verdict {
        match self.registry.open(cmd.primary(), cmd.secondary()) {
            Ok(session) => {
                debug!(sock = ctx.fd(), project = session.name(), "project selected");
                ctx.set_session(session);
                ctx.reply_ok(ok::PROJECT, Vec::new())
            }
            Err(code) => ctx.reply_err(code),
        }
    }
}

impl Handler for UniversalHandler {
    fn handle(&self, ctx: &mut Context, cmd: &Command<'_>) -> Verdict {
        match cmd.opcode() {
            opcode::QUIT => Verdict::quit(QuitReason::Normal),
            opcode::USE => self.use_project(ctx, cmd),
            opcode::DEBUG => {
                let info = ctx.describe();
                ctx.reply_ok(ok::INFO, info)
            }
            opcode::TIMEOUT => {
                ctx.set_timeout_secs(cmd.arg());
                debug!(sock = ctx.fd(), secs = cmd.arg(), "set new timeout");
                ctx.reply_ok(ok::TIMEOUT_SET, Vec::new())
            }
            _ => Verdict::next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::handler::tests::{pair, read_frame};
    use crate::connection::{Chain, Connection, HandlerTable, Outcome, ServerStats};
    use crate::protocol::ErrorCode;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn chain(dir: &std::path::Path) -> Chain {
        let registry = Arc::new(SessionRegistry::new(dir, 8));
        Chain::new(
            Arc::new(HandlerTable::new()),
            Arc::new(UniversalHandler::new(registry)),
        )
    }

    fn wire(cmd: &Command<'_>) -> Vec<u8> {
        let mut buf = bytes::BytesMut::new();
        cmd.encode(&mut buf);
        buf.to_vec()
    }

    /// Delivers `chunks` one read at a time and parses after each.
    fn deliver(conn: &mut Connection, client: &mut UnixStream, chain: &Chain, chunks: &[&[u8]]) -> Outcome {
        let mut outcome = Outcome::Continue;
        for chunk in chunks {
            client.write_all(chunk).unwrap();
            assert_eq!(conn.recv().unwrap(), chunk.len());
            outcome = conn.parse(chain, None);
        }
        outcome
    }

    #[test]
    fn test_use_creates_home() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain(dir.path());
        let (mut conn, mut client) = pair(Arc::new(ServerStats::new()));

        let frame = wire(&Command::new(opcode::USE, 0, "demo"));
        assert_eq!(deliver(&mut conn, &mut client, &chain, &[&frame]), Outcome::Continue);

        let reply = read_frame(&mut client);
        assert_eq!(reply.opcode(), opcode::OK);
        assert_eq!(reply.arg(), ok::PROJECT);
        assert!(dir.path().join("demo").is_dir());
        assert_eq!(conn.context().session().unwrap().name(), "demo");
    }

    #[test]
    fn test_use_split_across_reads() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain(dir.path());
        let frame = wire(&Command::new(opcode::USE, 0, "split_project"));

        let (mut whole, mut whole_client) = pair(Arc::new(ServerStats::new()));
        deliver(&mut whole, &mut whole_client, &chain, &[&frame]);
        let expected = read_frame(&mut whole_client);

        let (mut split, mut split_client) = pair(Arc::new(ServerStats::new()));
        let outcome = deliver(
            &mut split,
            &mut split_client,
            &chain,
            &[&frame[..3], &frame[3..8], &frame[8..]],
        );
        assert_eq!(outcome, Outcome::Continue);

        let reply = read_frame(&mut split_client);
        assert_eq!(reply.header, expected.header);
        assert_eq!(reply.primary(), expected.primary());
        assert_eq!(split.context().session().unwrap().name(), "split_project");
    }

    #[test]
    fn test_use_rejects_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain(dir.path());
        let (mut conn, mut client) = pair(Arc::new(ServerStats::new()));

        for (name, code) in [
            ("", ErrorCode::Empty),
            ("UPPER", ErrorCode::InvalidChar),
            ("a_name_that_is_far_too_long_for_it", ErrorCode::TooLong),
        ] {
            let frame = wire(&Command::new(opcode::USE, 0, name));
            deliver(&mut conn, &mut client, &chain, &[&frame]);
            assert_eq!(read_frame(&mut client).arg(), code.code());
        }
        assert!(conn.context().session().is_none());
    }

    #[test]
    fn test_use_with_home_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        let chain = chain(dir.path());
        let (mut conn, mut client) = pair(Arc::new(ServerStats::new()));

        let home = file.to_string_lossy().into_owned();
        let cmd = Command::with_secondary(opcode::USE, 0, b"other", home.as_bytes());
        deliver(&mut conn, &mut client, &chain, &[&wire(&cmd)]);
        assert_eq!(read_frame(&mut client).arg(), ErrorCode::InvalidHome.code());
    }

    #[test]
    fn test_timeout_and_quit() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain(dir.path());
        let (mut conn, mut client) = pair(Arc::new(ServerStats::new()));

        let mut frames = wire(&Command::empty(opcode::TIMEOUT, 30));
        frames.extend(wire(&Command::empty(opcode::QUIT, 0)));
        let outcome = deliver(&mut conn, &mut client, &chain, &[&frames]);

        assert_eq!(outcome, Outcome::Quit(QuitReason::Normal));
        assert_eq!(read_frame(&mut client).arg(), ok::TIMEOUT_SET);
        assert_eq!(conn.context().timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_debug_dump() {
        let dir = tempfile::tempdir().unwrap();
        let chain = chain(dir.path());
        let (mut conn, mut client) = pair(Arc::new(ServerStats::new()));

        let mut frames = wire(&Command::new(opcode::USE, 0, "dbg"));
        frames.extend(wire(&Command::empty(opcode::DEBUG, 0)));
        deliver(&mut conn, &mut client, &chain, &[&frames]);

        assert_eq!(read_frame(&mut client).arg(), ok::PROJECT);
        let info = read_frame(&mut client);
        assert_eq!(info.arg(), ok::INFO);
        let text = info.primary_str();
        assert!(text.contains("name:dbg"));
        assert!(text.contains("cmds list:"));
    }
}
