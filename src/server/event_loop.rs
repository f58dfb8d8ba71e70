//! Worker Event Loop
//!
//! Every worker process runs one single-threaded tokio runtime. It owns the
//! listening socket and every connection that is not currently inside a
//! pool task.
//!
//! ```text
//!                 ┌──────────────────────── event loop ───────────────────────┐
//!   listener ───► │ accept ──► drive(conn) ──parse──► Continue: wait readable │
//!                 │                 │                                         │
//!                 │                 ├── Pause ──► pool.submit(ConnectionTask) │──► pool thread
//!                 │                 └── Quit  ──► conn.quit(reason)           │        │
//!                 │                                                           │        │
//!   pipe reader ◄─┼── Resume(conn) ──► drive(conn) again ◄────────────────────┼── push_back
//!                 │   Stop          ──► stop accepting, drain                 │
//!                 │   terminate     ──► exit now                              │
//!                 │                                                           │
//!                 │ reaper: every 20s cancel overdue tasks (unless keepalive) │
//!                 └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Shutdown
//!
//! A graceful stop closes the listener, quits connections that come back
//! from the pool and keeps serving loop-owned connections until none is
//! left. A failing `accept` (out of descriptors, for one) triggers the same
//! graceful stop instead of retrying. An immediate stop drops every connection right away. Either way
//! the pool is shut down last: gracefully after a drain, forcibly after an
//! immediate stop.

use crate::commands::{worker_table, UniversalHandler};
use crate::config::ServerConfig;
use crate::connection::{Chain, Connection, Listener, Outcome, QuitReason, ServerStats, Stream};
use crate::pool::{PoolError, Reaper, ReaperConfig, ShutdownMode, ThreadPool};
use crate::server::handoff::{self, Handoff, PipeMessage, PipeReader};
use crate::server::task::ConnectionTask;
use crate::session::SessionRegistry;
use crate::storage::Backend;
use anyhow::Context as _;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, info, warn};

/// How often a draining loop checks whether its last connection is gone.
const DRAIN_TICK: Duration = Duration::from_millis(50);

/// Everything a connection needs, on the loop and on pool threads.
pub struct Services {
    pub chain: Chain,
    pub backend: Arc<dyn Backend>,
    pub sessions: Arc<SessionRegistry>,
    pub pool: Arc<ThreadPool>,
    pub handoff: Handoff,
    pub stats: Arc<ServerStats>,
    pub keepalive: Arc<AtomicBool>,
}

impl Services {
    /// Builds the worker's services and the pipe reader that goes with the
    /// handoff. Spawns the pool's initial threads.
    pub fn build(config: &ServerConfig, backend: Arc<dyn Backend>) -> (Arc<Self>, PipeReader) {
        let sessions = Arc::new(SessionRegistry::new(&config.data_dir, config.cache_capacity));
        let pool = Arc::new(ThreadPool::new(config.pool.clone()));
        let keepalive = Arc::new(AtomicBool::new(false));
        let chain = Chain::new(
            Arc::new(worker_table(Arc::clone(&pool), Arc::clone(&keepalive))),
            Arc::new(UniversalHandler::new(Arc::clone(&sessions))),
        );
        let (handoff, pipe) = handoff::channel();

        let services = Arc::new(Self {
            chain,
            backend,
            sessions,
            pool,
            handoff,
            stats: Arc::new(ServerStats::new()),
            keepalive,
        });
        (services, pipe)
    }

    /// Hands a paused connection to the pool. If the pool refuses it, the
    /// task's cleanup has already closed the connection.
    pub fn submit(self: &Arc<Self>, conn: Connection) {
        let fd = conn.fd();
        self.stats.task_submitted();
        let task = Box::new(ConnectionTask::new(conn, Arc::clone(self)));
        match self.pool.submit(task) {
            Ok(()) => debug!(sock = fd, "connection submitted to the pool"),
            Err(PoolError::ShutDown) => warn!(sock = fd, "pool is shut down, connection dropped"),
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("pool", &self.pool)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Asks a running worker to stop. Safe to use from any thread.
#[derive(Debug, Clone)]
pub struct WorkerControl {
    handoff: Handoff,
    terminate: Arc<watch::Sender<bool>>,
}

impl WorkerControl {
    /// Graceful stop: no new connections, drain the existing ones.
    pub fn stop(&self) {
        self.handoff.stop();
    }

    /// Immediate stop: drop every connection and cancel running tasks.
    pub fn terminate(&self) {
        self.terminate.send_replace(true);
    }
}

/// One worker: a listener plus the services that serve its connections.
pub struct Worker {
    config: ServerConfig,
    listener: Listener,
    services: Arc<Services>,
    pipe: PipeReader,
    terminate_tx: Arc<watch::Sender<bool>>,
    terminate_rx: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(config: ServerConfig, listener: Listener, backend: Arc<dyn Backend>) -> Self {
        let (services, pipe) = Services::build(&config, backend);
        let (terminate_tx, terminate_rx) = watch::channel(false);
        Self {
            config,
            listener,
            services,
            pipe,
            terminate_tx: Arc::new(terminate_tx),
            terminate_rx,
        }
    }

    pub fn control(&self) -> WorkerControl {
        WorkerControl {
            handoff: self.services.handoff.clone(),
            terminate: Arc::clone(&self.terminate_tx),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Runs the worker on a fresh single-threaded runtime until it stops.
    pub fn run(self) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build the worker runtime")?;
        runtime.block_on(self.serve())
    }

    /// The event loop itself.
    pub async fn serve(self) -> anyhow::Result<()> {
        let Worker {
            config,
            listener,
            services,
            mut pipe,
            terminate_tx: _terminate_tx,
            terminate_rx: mut terminate,
        } = self;

        let reaper = Reaper::start(
            Arc::clone(&services.pool),
            Arc::clone(&services.keepalive),
            ReaperConfig {
                interval: config.reap_interval,
                task_timeout: config.task_timeout,
            },
        );
        let mut listener = Some(
            AsyncFd::with_interest(listener, Interest::READABLE)
                .context("failed to register the listening socket")?,
        );
        let mut conns = JoinSet::new();
        let mut drain = time::interval(DRAIN_TICK);
        let mut immediate = false;

        info!(pid = std::process::id(), "worker event loop started");

        loop {
            tokio::select! {
                accepted = accept_one(listener.as_ref()), if listener.is_some() => match accepted {
                    Ok(Some(stream)) => {
                        if let Err(e) = stream.set_nonblocking(true) {
                            warn!(error = %e, "failed to set accepted socket non-blocking");
                            continue;
                        }
                        let conn = Connection::new(stream, Arc::clone(&services.stats), &config.conn);
                        debug!(sock = conn.fd(), peer = conn.context().peer(), "accepted new connection");
                        conns.spawn(drive(conn, Arc::clone(&services)));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(error = %e, "accept failed, server stop gracefully");
                        pipe.mark_stopped();
                        listener = None;
                    }
                },
                message = pipe.recv() => match message {
                    Some(PipeMessage::Resume(conn)) => {
                        if pipe.is_stopped() {
                            conn.quit(QuitReason::Stopped);
                        } else {
                            conns.spawn(drive(conn, Arc::clone(&services)));
                        }
                    }
                    Some(PipeMessage::Stop) => {
                        if pipe.mark_stopped() {
                            info!(active = services.stats.active(), "stop accepting, draining connections");
                            listener = None;
                        }
                    }
                    None => break,
                },
                Ok(()) = terminate.changed() => {
                    info!("immediate shutdown requested");
                    immediate = true;
                    break;
                }
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
                _ = drain.tick(), if listener.is_none() => {
                    if services.stats.active() == 0 {
                        break;
                    }
                }
            }
        }

        pipe.mark_stopped();
        drop(listener);
        reaper.stop();
        conns.shutdown().await;

        let mode = if immediate {
            ShutdownMode::Forced
        } else {
            ShutdownMode::Graceful
        };
        let pool = Arc::clone(&services.pool);
        tokio::task::spawn_blocking(move || pool.shutdown(mode))
            .await
            .context("thread pool shutdown panicked")?;

        info!(pid = std::process::id(), ?mode, "worker event loop exited");
        Ok(())
    }
}

/// Waits for the listener and accepts one client; `Ok(None)` on a spurious
/// wakeup or a transient failure. Any error returned is persistent.
async fn accept_one(listener: Option<&AsyncFd<Listener>>) -> io::Result<Option<Stream>> {
    let Some(listener) = listener else {
        return std::future::pending().await;
    };
    let mut guard = listener.readable().await?;
    match guard.try_io(|inner| inner.get_ref().accept()) {
        Ok(Ok(stream)) => Ok(Some(stream)),
        Ok(Err(e)) if is_transient(&e) => {
            debug!(error = %e, "accept interrupted, retry");
            Ok(None)
        }
        Ok(Err(e)) => Err(e),
        Err(_would_block) => Ok(None),
    }
}

/// Accept failures that say nothing about the listener itself.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionAborted
    )
}

/// What one readiness wait produced.
enum Step {
    Idle,
    Data,
    Quit(QuitReason),
}

async fn read_step(fd: &mut AsyncFd<Connection>) -> Step {
    let idle = fd.get_ref().context().timeout();
    let ready = match idle {
        Some(idle) => match time::timeout(idle, fd.readable_mut()).await {
            Ok(ready) => ready,
            Err(_) => return Step::Quit(QuitReason::Timeout),
        },
        None => fd.readable_mut().await,
    };
    let mut guard = match ready {
        Ok(guard) => guard,
        Err(e) => {
            debug!(error = %e, "readiness wait failed");
            return Step::Quit(QuitReason::IoError);
        }
    };
    match guard.try_io(|inner| inner.get_mut().recv()) {
        Ok(Ok(0)) => Step::Quit(QuitReason::Closed),
        Ok(Ok(_)) => Step::Data,
        Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => Step::Idle,
        Ok(Err(e)) => {
            debug!(error = %e, "read failed");
            Step::Quit(QuitReason::IoError)
        }
        Err(_would_block) => Step::Idle,
    }
}

/// Serves a connection on the loop until it pauses or quits.
///
/// A connection resumed from the pool may already hold buffered commands;
/// those are parsed before waiting for more data.
async fn drive(conn: Connection, services: Arc<Services>) {
    let mut fd = match AsyncFd::try_with_interest(conn, Interest::READABLE) {
        Ok(fd) => fd,
        Err(err) => {
            let (conn, e) = err.into_parts();
            error!(sock = conn.fd(), error = %e, "failed to register connection");
            conn.quit(QuitReason::IoError);
            return;
        }
    };

    let mut pending = !fd.get_ref().inbox().is_empty();
    loop {
        if pending {
            match fd.get_mut().parse(&services.chain, None) {
                Outcome::Pause => {
                    services.submit(fd.into_inner());
                    return;
                }
                Outcome::Quit(reason) => {
                    fd.into_inner().quit(reason);
                    return;
                }
                _ => {}
            }
        }
        pending = match read_step(&mut fd).await {
            Step::Idle => false,
            Step::Data => true,
            Step::Quit(reason) => {
                fd.into_inner().quit(reason);
                return;
            }
        };
    }
}
