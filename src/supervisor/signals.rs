//! Signal Masks and the Worker Signal Thread
//!
//! Signals are never handled asynchronously. The master blocks its set and
//! waits on it with `sigwait`; a worker keeps the inherited mask (so every
//! thread it creates has the signals blocked too) and dedicates one thread
//! to waiting on them.

use crate::server::WorkerControl;
use nix::sys::signal::{SigSet, Signal};
use std::io;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// Signals a worker reacts to.
pub fn worker_signals() -> SigSet {
    let mut set = SigSet::empty();
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT, Signal::SIGHUP] {
        set.add(signal);
    }
    set
}

/// Signals the master waits on.
pub fn master_signals() -> SigSet {
    let mut set = worker_signals();
    set.add(Signal::SIGCHLD);
    set
}

/// What a worker does about a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerAction {
    Stop,
    Terminate,
    Ignore,
}

pub fn worker_action(signal: Signal) -> WorkerAction {
    match signal {
        Signal::SIGINT => WorkerAction::Stop,
        Signal::SIGTERM | Signal::SIGQUIT => WorkerAction::Terminate,
        _ => WorkerAction::Ignore,
    }
}

/// Starts the thread that turns signals into worker stop requests.
///
/// The worker signals must already be blocked in the calling thread.
pub fn spawn_signal_thread(control: WorkerControl) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            let set = worker_signals();
            loop {
                let signal = match set.wait() {
                    Ok(signal) => signal,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        warn!(error = %e, "sigwait failed, signal thread exits");
                        return;
                    }
                };
                match worker_action(signal) {
                    WorkerAction::Stop => {
                        info!("caught SIGINT, shutdown gracefully");
                        control.stop();
                    }
                    WorkerAction::Terminate => {
                        info!(signal = signal.as_str(), "caught signal, terminate immediately");
                        control.terminate();
                    }
                    WorkerAction::Ignore => {
                        info!(signal = signal.as_str(), "caught reload signal, nothing to do");
                    }
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_sets() {
        let worker = worker_signals();
        assert!(worker.contains(Signal::SIGINT));
        assert!(worker.contains(Signal::SIGQUIT));
        assert!(!worker.contains(Signal::SIGCHLD));

        let master = master_signals();
        assert!(master.contains(Signal::SIGCHLD));
        assert!(master.contains(Signal::SIGHUP));
    }

    #[test]
    fn test_worker_actions() {
        assert_eq!(worker_action(Signal::SIGINT), WorkerAction::Stop);
        assert_eq!(worker_action(Signal::SIGTERM), WorkerAction::Terminate);
        assert_eq!(worker_action(Signal::SIGQUIT), WorkerAction::Terminate);
        assert_eq!(worker_action(Signal::SIGHUP), WorkerAction::Ignore);
    }
}
