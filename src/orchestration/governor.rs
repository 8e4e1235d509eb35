//! Process governor.
//!
//! The governor owns every live worker process handle. It is not
//! story-aware: it only knows pids, how to signal them, and when they exit.
//! Each registered child is moved into a supervisor task that waits on it,
//! deregisters it exactly once, and publishes the exit through a `watch`
//! channel that any number of callers can await.
//!
//! Signals are queued to the supervisor, which delivers them only while
//! the child is still unreaped, so a recycled pid is never signalled.

use futures::future::join_all;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{slog, slog_debug, slog_warn, Error, Result};

type Sender = mpsc::UnboundedSender<Signal>;

/// Upper bound on how long to wait for a process after SIGKILL.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

/// How a tracked process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessExit {
    pub code: Option<i32>,
    /// Terminating signal number, if the process was killed.
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: std::io::Result<std::process::ExitStatus>) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match status {
            Ok(status) => Self {
                code: status.code(),
                signal: status.signal(),
            },
            Err(e) => {
                slog_warn!("Failed to wait on child: {}", e);
                Self::default()
            }
        }
    }
}

/// Governor-side record of one live process.
#[derive(Debug)]
struct ProcessRecord {
    started_at: Instant,
    signals: mpsc::UnboundedSender<Signal>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

/// Caller-side handle to a registered process.
#[derive(Debug, Clone)]
pub struct TrackedProcess {
    pid: u32,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl TrackedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// The exit, if the process has already ended.
    pub fn try_exit(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Wait for the process to end. Safe to call repeatedly.
    pub async fn wait(&self) -> ProcessExit {
        wait_exit(self.exit.clone()).await
    }
}

async fn wait_exit(mut rx: watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    match rx.wait_for(Option::is_some).await {
        Ok(exit) => (*exit).unwrap_or_default(),
        Err(_) => ProcessExit::default(),
    }
}

/// Outcome of a graceful-then-forced shutdown pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Processes that exited within the grace period.
    pub graceful: usize,
    /// Processes that had to be sent SIGKILL.
    pub forced: usize,
}

impl ShutdownReport {
    pub fn total(&self) -> usize {
        self.graceful + self.forced
    }
}

#[derive(Debug, Default)]
struct GovernorInner {
    processes: Mutex<HashMap<u32, ProcessRecord>>,
    cleaning: AtomicBool,
}

/// Registry of live worker processes.
///
/// Cheap to clone; clones share the same registry. Construct one per
/// orchestrator and pass it in, so tests get independent registries.
#[derive(Debug, Clone, Default)]
pub struct ProcessGovernor {
    inner: Arc<GovernorInner>,
}

impl ProcessGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    fn processes(&self) -> MutexGuard<'_, HashMap<u32, ProcessRecord>> {
        // Poisoning only means a panic elsewhere; the map itself stays valid.
        self.inner
            .processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start tracking a spawned child.
    ///
    /// The child is moved into a supervisor task. The caller must take any
    /// stdio handles it needs before registering.
    ///
    /// # Errors
    ///
    /// Returns `Error::Spawn` if the child has already been reaped and has
    /// no pid.
    pub fn register(&self, mut child: Child) -> Result<TrackedProcess> {
        let pid = child
            .id()
            .ok_or_else(|| Error::Spawn("child exited before registration".to_string()))?;
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        self.processes().insert(
            pid,
            ProcessRecord {
                started_at: Instant::now(),
                signals: signal_tx,
                exit: exit_rx.clone(),
            },
        );
        slog_debug!("Governor: registered pid {}", pid);

        let governor = self.clone();
        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(signal) = signal_rx.recv() => match child.try_wait() {
                        // An unreaped child keeps its pid, even as a zombie.
                        Ok(None) => {
                            let _ = kill(Pid::from_raw(pid as i32), signal);
                        }
                        Ok(Some(status)) => break Ok(status),
                        Err(e) => break Err(e),
                    },
                }
            };
            drop(signal_rx);
            let exit = ProcessExit::from_status(status);
            if let Some(record) = governor.processes().remove(&pid) {
                slog_debug!(
                    "Governor: pid {} exited after {:?} (code={:?}, signal={:?})",
                    pid,
                    record.started_at.elapsed(),
                    exit.code,
                    exit.signal
                );
            }
            let _ = exit_tx.send(Some(exit));
        });

        Ok(TrackedProcess { pid, exit: exit_rx })
    }

    pub fn active_count(&self) -> usize {
        self.processes().len()
    }

    pub fn is_tracked(&self, pid: u32) -> bool {
        self.processes().contains_key(&pid)
    }

    /// Queue `signal` for every tracked process.
    ///
    /// Best effort: a process that exits before its supervisor gets to the
    /// signal is simply not signalled. Returns how many were queued.
    pub fn kill_all(&self, signal: Signal) -> usize {
        self.processes()
            .values()
            .filter(|record| record.signals.send(signal).is_ok())
            .count()
    }

    /// Force-kill a single tracked process.
    pub fn kill(&self, pid: u32) {
        if let Some(record) = self.processes().get(&pid) {
            let _ = record.signals.send(Signal::SIGKILL);
        }
    }

    /// SIGKILL every tracked pid directly, bypassing the supervisors.
    ///
    /// Only for the panic hook, where the runtime may never poll the
    /// supervisors again. Racy against a pid being reaped and reused.
    fn kill_all_now(&self) {
        for pid in self.processes().keys() {
            let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGKILL);
        }
    }

    /// SIGTERM every tracked process, then SIGKILL whatever is still alive
    /// when `grace` runs out.
    ///
    /// Resolves once every process has exited or been force-killed. A call
    /// made while another pass is running does not signal anything; it only
    /// waits for the processes that were live when it was made.
    pub async fn kill_all_with_timeout(&self, grace: Duration) -> ShutdownReport {
        let snapshot: Vec<(u32, Sender, watch::Receiver<Option<ProcessExit>>)> = self
            .processes()
            .iter()
            .map(|(pid, r)| (*pid, r.signals.clone(), r.exit.clone()))
            .collect();

        if self.inner.cleaning.swap(true, Ordering::SeqCst) {
            slog_debug!("Governor: shutdown already in progress, waiting");
            join_all(snapshot.into_iter().map(|(_, _, rx)| wait_exit(rx))).await;
            return ShutdownReport::default();
        }

        if !snapshot.is_empty() {
            slog!(
                "Governor: terminating {} process(es), grace {:?}",
                snapshot.len(),
                grace
            );
        }

        for (_, signals, _) in &snapshot {
            let _ = signals.send(Signal::SIGTERM);
        }

        let deadline = tokio::time::Instant::now() + grace;
        let waits = snapshot.into_iter().map(|(pid, signals, rx)| async move {
            if tokio::time::timeout_at(deadline, wait_exit(rx.clone()))
                .await
                .is_ok()
            {
                return false;
            }
            slog_warn!("Governor: pid {} ignored SIGTERM, sending SIGKILL", pid);
            let _ = signals.send(Signal::SIGKILL);
            let _ = tokio::time::timeout(FORCE_KILL_WAIT, wait_exit(rx)).await;
            true
        });

        let mut report = ShutdownReport::default();
        for forced in join_all(waits).await {
            if forced {
                report.forced += 1;
            } else {
                report.graceful += 1;
            }
        }

        self.inner.cleaning.store(false, Ordering::SeqCst);
        report
    }
}

/// Make the governor the last line of defense on abnormal shutdown.
///
/// A panic anywhere SIGKILLs every tracked process before the previous
/// panic hook runs. SIGINT or SIGTERM cancels `cancel`, so no further
/// workers are dispatched, then triggers `kill_all_with_timeout`; the
/// returned handle resolves with its report once that pass is done, so the
/// caller can race it against its own work and exit.
///
/// # Errors
///
/// Returns an error if the signal listeners cannot be registered.
pub fn install_shutdown_handlers(
    governor: ProcessGovernor,
    cancel: CancellationToken,
    grace: Duration,
) -> Result<JoinHandle<ShutdownReport>> {
    use tokio::signal::unix::{signal, SignalKind};

    let panic_governor = governor.clone();
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        panic_governor.kill_all_now();
        previous(info);
    }));

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        slog_warn!("Received {}, shutting down workers", name);
        cancel.cancel();
        let report = governor.kill_all_with_timeout(grace).await;
        slog!(
            "Shutdown complete: {} graceful, {} forced",
            report.graceful,
            report.forced
        );
        report
    }))
}
