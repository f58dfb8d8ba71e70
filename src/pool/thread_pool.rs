//! Elastic Thread Pool
//!
//! A FIFO queue of [`Task`]s served by a bounded, self-sizing set of OS
//! threads. One mutex guards the whole pool state; one condition variable
//! wakes idle threads.
//!
//! ## Sizing
//!
//! ```text
//!   new()              spawn max_spare threads
//!   submit()           queued > idle  →  spawn up to min_spare more,
//!                                        never beyond max_total
//!   task finished      nothing queued and idle >= max_spare
//!                      →  the thread exits
//!   task cancelled     cleanup runs, the thread exits
//! ```
//!
//! After a burst, the number of idle threads converges to at most
//! `max_spare`; the total never exceeds `max_total`.
//!
//! ## Slots
//!
//! Each live thread occupies a slot (by index) that records its state, call
//! count, running time and the [`CancelToken`] of its current task. The
//! timeout sweep and forced shutdown trip these tokens.

use crate::config::PoolConfig;
use crate::pool::task::{CancelToken, Task, TaskStatus};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Errors returned by [`ThreadPool::submit`].
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool no longer accepts work; the task has been cancelled
    #[error("thread pool is shut down")]
    ShutDown,
}

/// How [`ThreadPool::shutdown`] treats running tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Let running tasks finish
    Graceful,
    /// Trip the cancel token of every running task
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Busy,
}

struct Slot {
    state: SlotState,
    calls: u64,
    started: Option<Instant>,
    label: String,
    token: CancelToken,
    thread: Option<JoinHandle<()>>,
}

struct State {
    queue: VecDeque<Box<dyn Task>>,
    slots: Vec<Option<Slot>>,
    total: usize,
    idle: usize,
    created: u64,
    shutdown: Option<ShutdownMode>,
}

struct Shared {
    config: PoolConfig,
    state: Mutex<State>,
    cond: Condvar,
}

/// The worker thread pool.
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Creates the pool and its first `max_spare` threads.
    pub fn new(config: PoolConfig) -> Self {
        let config = config.normalize();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                slots: (0..config.max_total).map(|_| None).collect(),
                total: 0,
                idle: 0,
                created: 0,
                shutdown: None,
            }),
            cond: Condvar::new(),
            config,
        });

        {
            let mut state = shared.state.lock();
            let spawned = spawn_threads(&shared, &mut state, shared.config.max_spare);
            info!(
                threads = spawned,
                max_total = shared.config.max_total,
                min_spare = shared.config.min_spare,
                max_spare = shared.config.max_spare,
                "thread pool initialized"
            );
        }
        Self { shared }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Queues a task. When no idle thread is left to pick it up, up to
    /// `min_spare` threads are added (bounded by `max_total`).
    ///
    /// Idle threads that have been signalled but not yet woken still count
    /// as idle, so "left to pick it up" means fewer idle threads than
    /// queued tasks rather than an idle count of zero.
    pub fn submit(&self, task: Box<dyn Task>) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        if state.shutdown.is_some() {
            drop(state);
            warn!(task = %task.label(), "pool is shut down, task rejected");
            task.cancel();
            return Err(PoolError::ShutDown);
        }

        state.queue.push_back(task);
        trace!(queued = state.queue.len(), idle = state.idle, total = state.total, "task added");
        if state.queue.len() > state.idle {
            let room = self.shared.config.max_total.saturating_sub(state.total);
            let count = self.shared.config.min_spare.min(room);
            if count > 0 {
                let spawned = spawn_threads(&self.shared, &mut state, count);
                debug!(spawned, total = state.total, "added spare threads");
            }
        }
        self.shared.cond.notify_one();
        Ok(())
    }

    /// Trips the cancel token of every task that has been running longer
    /// than `threshold`. Returns how many were newly cancelled.
    pub fn cancel_timeout(&self, threshold: Duration) -> usize {
        let state = self.shared.state.lock();
        let mut count = 0;
        for (index, slot) in state.slots.iter().enumerate() {
            let Some(slot) = slot else { continue };
            if slot.state != SlotState::Busy {
                continue;
            }
            let Some(started) = slot.started else { continue };
            let cost = started.elapsed();
            if cost > threshold && slot.token.cancel() {
                debug!(index, secs = cost.as_secs(), task = %slot.label, "cancel thread because it timed out");
                count += 1;
            }
        }
        count
    }

    /// Stops the pool: queued tasks are cancelled, idle threads exit,
    /// running tasks finish (`Graceful`) or are cancelled (`Forced`), and
    /// every thread is joined.
    pub fn shutdown(&self, mode: ShutdownMode) {
        let (queued, handles) = {
            let mut state = self.shared.state.lock();
            if mode == ShutdownMode::Forced {
                state.shutdown = Some(ShutdownMode::Forced);
                for slot in state.slots.iter().flatten() {
                    if slot.state == SlotState::Busy {
                        slot.token.cancel();
                    }
                }
            } else if state.shutdown.is_none() {
                state.shutdown = Some(ShutdownMode::Graceful);
            }

            let queued: Vec<Box<dyn Task>> = state.queue.drain(..).collect();
            let me = thread::current().id();
            let handles: Vec<JoinHandle<()>> = state
                .slots
                .iter_mut()
                .flatten()
                .filter_map(|slot| slot.thread.take())
                .filter(|handle| handle.thread().id() != me)
                .collect();
            self.shared.cond.notify_all();
            (queued, handles)
        };

        if queued.is_empty() && handles.is_empty() {
            return;
        }
        info!(?mode, queued = queued.len(), threads = handles.len(), "shutting down thread pool");
        for task in queued {
            run_cleanup(task, None);
        }
        for handle in handles {
            if handle.join().is_err() {
                warn!("pool thread panicked while exiting");
            }
        }
        debug!("all pool threads exited");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown.is_some()
    }

    /// Live threads.
    pub fn threads(&self) -> usize {
        self.shared.state.lock().total
    }

    /// Threads waiting for work.
    pub fn idle(&self) -> usize {
        self.shared.state.lock().idle
    }

    /// Tasks waiting for a thread.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Threads created since the pool started.
    pub fn created(&self) -> u64 {
        self.shared.state.lock().created
    }

    /// Text snapshot of the pool for debugging.
    pub fn draw(&self) -> String {
        let state = self.shared.state.lock();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "TPOOL {{ status:'{}', total:{}, spare:{}, max:{}, created:{} }}",
            match state.shutdown {
                None => "-",
                Some(ShutdownMode::Graceful) => "G",
                Some(ShutdownMode::Forced) => "F",
            },
            state.total,
            state.idle,
            self.shared.config.max_total,
            state.created
        );
        let _ = writeln!(
            out,
            " = TODO task queue: {}",
            if state.queue.is_empty() { "NULL" } else { "" }
        );
        for (i, task) in state.queue.iter().enumerate() {
            let _ = writeln!(out, " = task[{}] {{{}}}", i, task.label());
        }
        for (i, slot) in state.slots.iter().enumerate() {
            let Some(slot) = slot else { continue };
            let _ = write!(
                out,
                " - thread[{}] {{status:'A{}', calls:{}, task:{{",
                i,
                if slot.state == SlotState::Busy { "BT" } else { "--" },
                slot.calls
            );
            if let (SlotState::Busy, Some(started)) = (slot.state, slot.started) {
                let _ = write!(out, "{}, timed:{}", slot.label, started.elapsed().as_secs());
            }
            out.push_str("}}\n");
        }
        out
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ThreadPool")
            .field("config", &self.shared.config)
            .field("total", &state.total)
            .field("idle", &state.idle)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown(ShutdownMode::Forced);
    }
}

/// Spawns up to `count` threads into free slots. Called with the lock held;
/// the new threads start out idle.
fn spawn_threads(shared: &Arc<Shared>, state: &mut State, count: usize) -> usize {
    let mut spawned = 0;
    for index in 0..state.slots.len() {
        if spawned == count {
            break;
        }
        if state.slots[index].is_some() {
            continue;
        }

        let worker = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name(format!("pool-{index}"))
            .spawn(move || worker_loop(worker, index));
        match handle {
            Ok(handle) => {
                state.slots[index] = Some(Slot {
                    state: SlotState::Idle,
                    calls: 0,
                    started: None,
                    label: String::new(),
                    token: CancelToken::new(),
                    thread: Some(handle),
                });
                state.total += 1;
                state.idle += 1;
                state.created += 1;
                spawned += 1;
                trace!(index, "thread created");
            }
            Err(e) => {
                warn!(index, error = %e, "failed to spawn pool thread");
                break;
            }
        }
    }
    spawned
}

/// Frees the slot of an exiting thread. The thread is counted as busy.
fn retire(state: &mut State, index: usize) {
    if let Some(slot) = state.slots[index].take() {
        trace!(index, calls = slot.calls, "thread retired");
        state.total -= 1;
    }
}

fn run_cleanup(task: Box<dyn Task>, index: Option<usize>) {
    let label = task.label();
    if panic::catch_unwind(AssertUnwindSafe(move || task.cancel())).is_err() {
        error!(?index, task = %label, "task cleanup panicked");
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    let mut state = shared.state.lock();
    loop {
        while state.queue.is_empty() && state.shutdown.is_none() {
            shared.cond.wait(&mut state);
        }
        if state.shutdown.is_some() {
            state.idle -= 1;
            retire(&mut state, index);
            debug!(index, "thread exits on shutdown");
            return;
        }
        let Some(mut task) = state.queue.pop_front() else {
            continue;
        };

        state.idle -= 1;
        let token = CancelToken::new();
        if let Some(slot) = state.slots[index].as_mut() {
            slot.state = SlotState::Busy;
            slot.calls += 1;
            slot.started = Some(Instant::now());
            slot.label = task.label();
            slot.token = token.clone();
        }
        drop(state);

        trace!(index, task = %task.label(), "thread accepted task");
        let result = panic::catch_unwind(AssertUnwindSafe(|| task.execute(&token)));
        let finished = match result {
            Ok(TaskStatus::Finished) => true,
            Ok(TaskStatus::Cancelled) => {
                debug!(index, "task cancelled, running cleanup");
                false
            }
            Err(_) => {
                error!(index, "task panicked, running cleanup");
                false
            }
        };

        if !finished {
            run_cleanup(task, Some(index));
            let mut state = shared.state.lock();
            retire(&mut state, index);
            if state.shutdown.is_none() && state.queue.len() > state.idle {
                spawn_threads(&shared, &mut state, 1);
                shared.cond.notify_one();
            }
            return;
        }
        drop(task);

        state = shared.state.lock();
        if state.shutdown.is_some()
            || (state.queue.is_empty() && state.idle >= shared.config.max_spare)
        {
            debug!(index, idle = state.idle, "thread exits, enough spare threads");
            retire(&mut state, index);
            return;
        }
        if let Some(slot) = state.slots[index].as_mut() {
            slot.state = SlotState::Idle;
            slot.started = None;
        }
        state.idle += 1;
    }
}
