//! Master Process
//!
//! Binds the listener, forks the workers and then only waits for signals.
//! Worker exits are noticed through `SIGCHLD`, reaped with `waitpid` and
//! the vacant slots refilled.

use crate::config::ServerConfig;
use crate::connection::{Endpoint, Listener};
use crate::server::Worker;
use crate::storage::Backend;
use crate::supervisor::signals;
use crate::supervisor::SupervisorError;
use anyhow::Context as _;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often the master polls for exited workers during shutdown.
const REAP_POLL: Duration = Duration::from_millis(100);

/// Workers that die younger than this are respawned after a pause.
const MIN_UPTIME: Duration = Duration::from_secs(1);

/// Pause before respawning a worker that died right after starting.
const RESPAWN_DELAY: Duration = Duration::from_secs(1);

/// The per-process state built once before forking: configuration and the
/// listening socket every worker inherits.
#[derive(Debug)]
pub struct ProcessContext {
    config: ServerConfig,
    endpoint: Endpoint,
    listener: Listener,
}

impl ProcessContext {
    pub fn bind(config: ServerConfig) -> Result<Self, SupervisorError> {
        let endpoint = Endpoint::parse(&config.bind);
        let listener = Listener::bind(&endpoint)?;
        info!(endpoint = %endpoint, "listening socket bound");
        Ok(Self {
            config,
            endpoint,
            listener,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// The worker's copy of the context: the configuration plus its own
    /// handle on the shared listener.
    pub fn for_worker(&self) -> std::io::Result<(ServerConfig, Listener)> {
        Ok((self.config.clone(), self.listener.try_clone()?))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WorkerSlot {
    pid: Option<Pid>,
    started: Option<Instant>,
    spawns: u32,
}

/// Pids and spawn times of the workers, by index.
#[derive(Debug)]
pub struct WorkerTable {
    slots: Vec<WorkerSlot>,
}

impl WorkerTable {
    pub fn new(workers: usize) -> Self {
        Self {
            slots: vec![WorkerSlot::default(); workers],
        }
    }

    pub fn record_spawn(&mut self, index: usize, pid: Pid) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.pid = Some(pid);
            slot.started = Some(Instant::now());
            slot.spawns += 1;
        }
    }

    /// Frees the slot of an exited worker. Returns its index and uptime, or
    /// `None` for a pid that is not ours.
    pub fn record_exit(&mut self, pid: Pid) -> Option<(usize, Duration)> {
        let index = self.slots.iter().position(|slot| slot.pid == Some(pid))?;
        let slot = &mut self.slots[index];
        slot.pid = None;
        let uptime = slot.started.take().map_or(Duration::ZERO, |t| t.elapsed());
        Some((index, uptime))
    }

    /// Indices without a running worker.
    pub fn vacant(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.pid.is_none())
            .map(|(index, _)| index)
            .collect()
    }

    /// Running workers as `(index, pid)`.
    pub fn live(&self) -> Vec<(usize, Pid)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.pid.map(|pid| (index, pid)))
            .collect()
    }

    pub fn has_live(&self) -> bool {
        self.slots.iter().any(|slot| slot.pid.is_some())
    }

    /// How many times the worker at `index` has been started.
    pub fn spawns(&self, index: usize) -> u32 {
        self.slots.get(index).map_or(0, |slot| slot.spawns)
    }
}

/// The master process.
pub struct Supervisor<F> {
    ctx: ProcessContext,
    make_backend: F,
    table: WorkerTable,
}

impl<F> Supervisor<F>
where
    F: Fn(&ServerConfig) -> Arc<dyn Backend>,
{
    /// `make_backend` runs in each worker after the fork.
    pub fn new(ctx: ProcessContext, make_backend: F) -> Self {
        let table = WorkerTable::new(ctx.config.workers);
        Self {
            ctx,
            make_backend,
            table,
        }
    }

    /// Runs until a shutdown signal arrives and every worker is gone.
    pub fn run(mut self) -> Result<(), SupervisorError> {
        if self.ctx.config.workers == 0 {
            return self.run_inline();
        }

        let mask = signals::master_signals();
        mask.thread_block().map_err(SupervisorError::sys("block signals"))?;

        for index in 0..self.ctx.config.workers {
            self.spawn(index)?;
        }
        info!(
            workers = self.ctx.config.workers,
            endpoint = %self.ctx.endpoint(),
            pid = std::process::id(),
            "master ready, waiting for signals"
        );

        let outcome = loop {
            let signal = match mask.wait() {
                Ok(signal) => signal,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.shutdown(Signal::SIGTERM);
                    break Err(SupervisorError::Sys {
                        action: "wait for signals",
                        source: e,
                    });
                }
            };
            match signal {
                Signal::SIGCHLD => {
                    let exited = self.reap();
                    self.respawn(&exited);
                }
                Signal::SIGHUP => info!("caught reload signal, nothing to do"),
                Signal::SIGINT => {
                    info!("caught SIGINT, shutdown gracefully");
                    self.shutdown(Signal::SIGINT);
                    break Ok(());
                }
                Signal::SIGTERM => {
                    info!("caught SIGTERM, terminate immediately");
                    self.shutdown(Signal::SIGTERM);
                    break Ok(());
                }
                other => {
                    warn!(signal = other.as_str(), "caught exceptional signal, terminate immediately");
                    self.shutdown(Signal::SIGTERM);
                    break Err(SupervisorError::Exceptional(other));
                }
            }
        };

        self.ctx.listener.cleanup();
        info!("master exits");
        outcome
    }

    /// Single-process mode: one worker in the calling process.
    fn run_inline(self) -> Result<(), SupervisorError> {
        signals::worker_signals()
            .thread_block()
            .map_err(SupervisorError::sys("block signals"))?;
        let result = run_worker(&self.ctx, &self.make_backend);
        self.ctx.listener.cleanup();
        result.map_err(SupervisorError::Worker)
    }

    /// Forks the worker for slot `index`. The child never returns.
    fn spawn(&mut self, index: usize) -> Result<Pid, SupervisorError> {
        // SAFETY: the master is single-threaded when it forks, and the child
        // only builds fresh state before exiting through `process::exit`.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                self.table.record_spawn(index, child);
                info!(
                    worker = index + 1,
                    pid = child.as_raw(),
                    spawns = self.table.spawns(index),
                    "worker process spawned"
                );
                Ok(child)
            }
            Ok(ForkResult::Child) => {
                info!(worker = index + 1, pid = std::process::id(), "worker process started");
                let code = match run_worker(&self.ctx, &self.make_backend) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!(worker = index + 1, error = %format!("{e:#}"), "worker failed");
                        1
                    }
                };
                std::process::exit(code)
            }
            Err(e) => {
                error!(worker = index + 1, error = %e, "failed to spawn worker process");
                Err(SupervisorError::Sys {
                    action: "fork a worker",
                    source: e,
                })
            }
        }
    }

    /// Collects every exited worker without blocking.
    fn reap(&mut self) -> Vec<(usize, Duration)> {
        let mut exited = Vec::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    let Some(pid) = status.pid() else { continue };
                    match self.table.record_exit(pid) {
                        Some((index, uptime)) => {
                            info!(worker = index + 1, pid = pid.as_raw(), ?status, ?uptime, "worker process exited");
                            exited.push((index, uptime));
                        }
                        None => warn!(pid = pid.as_raw(), ?status, "unknown child process exited"),
                    }
                }
                Ok(status) => debug!(?status, "child status changed"),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "waitpid failed");
                    break;
                }
            }
        }
        exited
    }

    fn respawn(&mut self, exited: &[(usize, Duration)]) {
        let vacant = self.table.vacant();
        if vacant.is_empty() {
            return;
        }
        if exited.iter().any(|&(_, uptime)| uptime < MIN_UPTIME) {
            // a worker that dies at startup would otherwise be forked in a tight loop
            thread::sleep(RESPAWN_DELAY);
        }
        for index in vacant {
            let _ = self.spawn(index);
        }
    }

    /// Broadcasts `signal`, waits out the grace period and kills whatever
    /// is left.
    fn shutdown(&mut self, signal: Signal) {
        info!(signal = signal.as_str(), "broadcast exit signal to all worker processes");
        for (index, pid) in self.table.live() {
            if let Err(e) = kill(pid, signal) {
                warn!(worker = index + 1, pid = pid.as_raw(), error = %e, "failed to signal worker");
                self.table.record_exit(pid);
            }
        }

        let deadline = Instant::now() + self.ctx.config.shutdown_grace;
        while self.table.has_live() && Instant::now() < deadline {
            thread::sleep(REAP_POLL);
            self.reap();
        }

        let left = self.table.live();
        if left.is_empty() {
            return;
        }
        warn!(workers = left.len(), "grace period over, sending SIGKILL to remaining workers");
        for &(_, pid) in &left {
            let _ = kill(pid, Signal::SIGKILL);
        }
        for (_, pid) in left {
            let _ = waitpid(pid, None);
            self.table.record_exit(pid);
        }
    }
}

/// Body of a worker process (or of the single-process mode).
fn run_worker<F>(ctx: &ProcessContext, make_backend: &F) -> anyhow::Result<()>
where
    F: Fn(&ServerConfig) -> Arc<dyn Backend>,
{
    let (config, listener) = ctx
        .for_worker()
        .context("failed to duplicate the listening socket")?;
    let backend = make_backend(&config);
    let worker = Worker::new(config, listener, backend);
    signals::spawn_signal_thread(worker.control()).context("failed to start the signal thread")?;
    worker.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_table_tracks_spawns() {
        let mut table = WorkerTable::new(3);
        assert_eq!(table.vacant(), vec![0, 1, 2]);
        assert!(!table.has_live());

        table.record_spawn(0, Pid::from_raw(100));
        table.record_spawn(2, Pid::from_raw(102));
        assert_eq!(table.vacant(), vec![1]);
        assert_eq!(table.live(), vec![(0, Pid::from_raw(100)), (2, Pid::from_raw(102))]);

        let (index, _) = table.record_exit(Pid::from_raw(102)).unwrap();
        assert_eq!(index, 2);
        assert!(table.record_exit(Pid::from_raw(999)).is_none());
        assert_eq!(table.vacant(), vec![1, 2]);

        table.record_spawn(2, Pid::from_raw(103));
        assert_eq!(table.spawns(2), 2);
        assert_eq!(table.spawns(1), 0);
    }

    #[test]
    fn test_context_binds_once_for_all_workers() {
        let config = ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        let ctx = ProcessContext::bind(config).unwrap();
        let addr = ctx.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let (config, listener) = ctx.for_worker().unwrap();
        assert_eq!(listener.local_addr(), Some(addr));
        assert_eq!(config.workers, ctx.config().workers);
    }

    #[test]
    fn test_bind_failure() {
        let config = ServerConfig {
            bind: "/nonexistent-dir/searchd.sock".to_string(),
            ..Default::default()
        };
        assert!(matches!(ProcessContext::bind(config), Err(SupervisorError::Bind(_))));
    }
}
