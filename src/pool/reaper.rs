//! Background Task Reaper
//!
//! A pool task that never returns (a slow query, a client that stalls in
//! the middle of a transaction) would hold its thread forever. The reaper
//! runs on the worker's event loop and periodically asks the pool to cancel
//! every task that has been running longer than the task timeout.
//!
//! ```text
//!   every `interval`:
//!       keep-alive set?  ──yes──► skip
//!            │ no
//!            ▼
//!       pool.cancel_timeout(task_timeout)
//! ```
//!
//! Clients that legitimately need long tasks (bulk exports) switch the
//! process-wide keep-alive flag on with `SEARCH_KEEPALIVE`.

use crate::pool::ThreadPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Configuration for the reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Time between sweeps (default: 20s)
    pub interval: Duration,

    /// Tasks running longer than this are cancelled (default: 60s)
    pub task_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            task_timeout: Duration::from_secs(60),
        }
    }
}

/// A handle to the running reaper.
///
/// When this handle is dropped, the reaper task will be stopped.
#[derive(Debug)]
pub struct Reaper {
    shutdown_tx: watch::Sender<bool>,
}

impl Reaper {
    /// Starts the reaper as a background task on the current runtime.
    pub fn start(pool: Arc<ThreadPool>, keepalive: Arc<AtomicBool>, config: ReaperConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            interval_secs = config.interval.as_secs(),
            timeout_secs = config.task_timeout.as_secs(),
            "task reaper started"
        );
        tokio::spawn(reaper_loop(pool, keepalive, config, shutdown_rx));

        Self { shutdown_tx }
    }

    /// Stops the reaper. Called automatically on drop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn reaper_loop(
    pool: Arc<ThreadPool>,
    keepalive: Arc<AtomicBool>,
    config: ReaperConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("task reaper received shutdown signal");
                    return;
                }
            }
        }

        if keepalive.load(Ordering::Relaxed) {
            trace!("keep-alive is on, skip checking timed out tasks");
            continue;
        }

        match pool.cancel_timeout(config.task_timeout) {
            0 => trace!("no timed out pool tasks"),
            num => debug!(cancelled = num, "timed out pool tasks cancelled"),
        }
    }
}
