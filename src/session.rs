//! Project Sessions
//!
//! A client must select a project (`USE name [home]`) before issuing any
//! search command. The project binds the connection to a name and a home
//! directory; the [`SessionRegistry`] validates names, prepares home
//! directories and caches the resulting [`Session`]s so that later clients
//! selecting the same project skip the filesystem checks.

use crate::protocol::ErrorCode;
use crate::storage::{Cache, LruStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Project names must be shorter than this.
pub const MAX_NAME_LEN: usize = 32;

/// Custom home paths at least this long fall back to the default.
pub const MAX_HOME_LEN: usize = 128;

/// The project a connection is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    name: String,
    home: PathBuf,
}

impl Session {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn home(&self) -> &Path {
        &self.home
    }
}

/// Checks a project name: non-empty, under [`MAX_NAME_LEN`] bytes, made of
/// `[0-9a-z_-]` only.
pub fn validate_name(name: &[u8]) -> Result<&str, ErrorCode> {
    if name.is_empty() {
        return Err(ErrorCode::Empty);
    }
    if name.len() >= MAX_NAME_LEN {
        return Err(ErrorCode::TooLong);
    }
    if !name
        .iter()
        .all(|&b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
    {
        return Err(ErrorCode::InvalidChar);
    }
    std::str::from_utf8(name).map_err(|_| ErrorCode::InvalidChar)
}

/// Resolves and caches project sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    data_dir: PathBuf,
    cache: LruStore<String, Arc<Session>>,
}

impl SessionRegistry {
    /// Creates a registry rooted at `data_dir`, caching up to `capacity`
    /// sessions.
    pub fn new(data_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            cache: LruStore::new(capacity),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Returns the session for `name`, creating its home directory on first
    /// use. `home` overrides the default `<data_dir>/<name>` when non-empty.
    pub fn open(&self, name: &[u8], home: &[u8]) -> Result<Arc<Session>, ErrorCode> {
        let name = validate_name(name)?;
        if let Some(session) = self.cache.get(&name.to_string()) {
            debug!(project = name, "project found in session cache");
            return Ok(session);
        }

        let home = self.resolve_home(name, home);
        match std::fs::metadata(&home) {
            Ok(meta) if !meta.is_dir() => {
                warn!(home = %home.display(), "home of the project is not a valid directory");
                return Err(ErrorCode::InvalidHome);
            }
            Ok(_) => {}
            Err(_) => create_home(&home).map_err(|e| {
                warn!(home = %home.display(), error = %e, "failed to create home directory");
                ErrorCode::CreateHome
            })?,
        }

        let session = Arc::new(Session {
            name: name.to_string(),
            home,
        });
        self.cache.put(name.to_string(), Arc::clone(&session));
        debug!(project = name, home = %session.home.display(), "new project session");
        Ok(session)
    }

    fn resolve_home(&self, name: &str, home: &[u8]) -> PathBuf {
        if home.is_empty() || home.len() >= MAX_HOME_LEN {
            return self.data_dir.join(name);
        }
        let mut len = home.len();
        while len > 1 && home[len - 1] == b'/' {
            len -= 1;
        }
        PathBuf::from(String::from_utf8_lossy(&home[..len]).into_owned())
    }
}

#[cfg(unix)]
fn create_home(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new().mode(0o755).create(path)
}

#[cfg(not(unix))]
fn create_home(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name(b"demo_1-x"), Ok("demo_1-x"));
        assert_eq!(validate_name(b""), Err(ErrorCode::Empty));
        assert_eq!(validate_name(&[b'a'; 32]), Err(ErrorCode::TooLong));
        assert_eq!(validate_name(b"Demo"), Err(ErrorCode::InvalidChar));
        assert_eq!(validate_name(b"a b"), Err(ErrorCode::InvalidChar));
    }

    #[test]
    fn test_open_creates_default_home() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path(), 8);

        let session = registry.open(b"demo", b"").unwrap();
        assert_eq!(session.name(), "demo");
        assert_eq!(session.home(), dir.path().join("demo"));
        assert!(session.home().is_dir());
    }

    #[test]
    fn test_open_trims_custom_home() {
        let dir = tempfile::tempdir().unwrap();
        let custom = dir.path().join("custom");
        let registry = SessionRegistry::new(dir.path(), 8);

        let home = format!("{}//", custom.display());
        let session = registry.open(b"demo", home.as_bytes()).unwrap();
        assert_eq!(session.home(), custom);
        assert!(custom.is_dir());
    }

    #[test]
    fn test_open_rejects_file_as_home() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("demo"), b"not a dir").unwrap();
        let registry = SessionRegistry::new(dir.path(), 8);

        assert_eq!(registry.open(b"demo", b""), Err(ErrorCode::InvalidHome));
    }

    #[test]
    fn test_open_reports_uncreatable_home() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path().join("missing/parent"), 8);

        assert_eq!(registry.open(b"demo", b""), Err(ErrorCode::CreateHome));
    }

    #[test]
    fn test_open_uses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path(), 8);

        let first = registry.open(b"demo", b"").unwrap();
        let second = registry.open(b"demo", b"").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
