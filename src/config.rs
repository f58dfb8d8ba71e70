//! Server Configuration
//!
//! Every tunable the server reads at startup, with defaults. The binary
//! fills a [`ServerConfig`] from command-line flags; tests build one
//! directly with struct update syntax.

use crate::protocol::{BUFFER_SIZE, MAX_BODY_SIZE};
use std::path::PathBuf;
use std::time::Duration;

/// Default listen address (a bare port binds all interfaces).
pub const DEFAULT_BIND: &str = "8384";

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Idle timeout applied to new connections; `None` waits forever
    pub idle_timeout: Option<Duration>,
    /// Size of the receive and send buffers
    pub buffer_size: usize,
    /// Largest accepted command body
    pub max_body: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(5)),
            buffer_size: BUFFER_SIZE,
            max_body: MAX_BODY_SIZE,
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Hard limit on threads
    pub max_total: usize,
    /// Threads spawned at once when no idle thread is available
    pub min_spare: usize,
    /// Idle threads kept around after a burst
    pub max_spare: usize,
}

impl PoolConfig {
    /// Largest accepted `max_total`, also used when it is unset.
    pub const MAX_THREADS: usize = 100;

    /// Fallback for an unset `min_spare`.
    pub const MIN_SPARE: usize = 3;

    /// Fallback for an unset `max_spare`.
    pub const MAX_SPARE: usize = 6;

    /// Replaces zero limits with the fallbacks, then caps them so that
    /// `min_spare ≤ max_spare ≤ max_total ≤ 100`.
    pub fn normalize(mut self) -> Self {
        if self.max_total == 0 || self.max_total > Self::MAX_THREADS {
            self.max_total = Self::MAX_THREADS;
        }
        if self.max_spare == 0 {
            self.max_spare = Self::MAX_SPARE;
        }
        if self.min_spare == 0 {
            self.min_spare = Self::MIN_SPARE;
        }
        self.max_spare = self.max_spare.min(self.max_total);
        self.min_spare = self.min_spare.min(self.max_spare);
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 32,
            min_spare: 3,
            max_spare: 6,
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address: `port`, `host:port` or a Unix socket path
    pub bind: String,
    /// Worker processes; 0 runs a single worker in the master process
    pub workers: usize,
    /// Per-connection settings
    pub conn: ConnectionConfig,
    /// Worker pool sizing
    pub pool: PoolConfig,
    /// Longest a pool task may run before the reaper cancels it
    pub task_timeout: Duration,
    /// How often the reaper looks for overdue tasks
    pub reap_interval: Duration,
    /// Directory holding project homes
    pub data_dir: PathBuf,
    /// Entries kept in the project and result-total caches
    pub cache_capacity: usize,
    /// How long the master waits for workers before killing them
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Largest accepted worker count.
    pub const MAX_WORKERS: usize = 16;
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            workers: 3,
            conn: ConnectionConfig::default(),
            pool: PoolConfig::default(),
            task_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(20),
            data_dir: PathBuf::from("data"),
            cache_capacity: 1024,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind, "8384");
        assert_eq!(config.workers, 3);
        assert_eq!(config.conn.buffer_size, 1024);
        assert_eq!(config.conn.idle_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.pool, PoolConfig { max_total: 32, min_spare: 3, max_spare: 6 });
    }

    #[test]
    fn test_pool_normalize() {
        let pool = PoolConfig { max_total: 0, min_spare: 0, max_spare: 0 }.normalize();
        assert_eq!(pool, PoolConfig { max_total: 100, min_spare: 3, max_spare: 6 });

        let pool = PoolConfig { max_total: 500, min_spare: 0, max_spare: 0 }.normalize();
        assert_eq!(pool, PoolConfig { max_total: 100, min_spare: 3, max_spare: 6 });

        let pool = PoolConfig { max_total: 2, min_spare: 0, max_spare: 0 }.normalize();
        assert_eq!(pool, PoolConfig { max_total: 2, min_spare: 2, max_spare: 2 });

        let pool = PoolConfig { max_total: 4, min_spare: 10, max_spare: 8 }.normalize();
        assert_eq!(pool, PoolConfig { max_total: 4, min_spare: 4, max_spare: 4 });

        assert_eq!(PoolConfig::default().normalize(), PoolConfig::default());
    }
}
