//! Phase-barrier scheduler.
//!
//! The `Orchestrator` partitions stories into phases, dispatches each phase
//! into worker processes up to the concurrency ceiling, speaks the IPC
//! protocol with every worker, and consults the recovery breaker before
//! re-dispatching a failed story. Phase N+1 never starts before every story
//! of phase N has a terminal result.
//!
//! All bookkeeping (slots, results, retry queue) is mutated by the single
//! task running `execute`. Attempt tasks only report back through their
//! join handles and a pid channel.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::BufReader;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::{group_stories_by_phase, Story, StoryId, StoryStatus};
use crate::orchestration::breaker::RecoveryBreaker;
use crate::orchestration::classifier::{backoff, is_transient, Failure};
use crate::orchestration::governor::{ProcessGovernor, ShutdownReport, TrackedProcess};
use crate::orchestration::pool::WorkerPool;
use crate::orchestration::protocol::{
    ExecutionResult, IpcMessage, MessageBody, MessageReader, MessageWriter, Outcome,
};
use crate::orchestration::spawn::WorkerSpawner;
use crate::store::StoryStore;
use crate::workspace::WorkspaceProvisioner;
use crate::{slog, slog_debug, slog_error, slog_trace, slog_warn, Error, Result};

/// How often `shutdown` checks for workers that have left on their own.
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

/// What to do with stories whose dependency did not succeed in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DependencyPolicy {
    /// Do not dispatch them; record them as skipped.
    #[default]
    #[serde(rename = "skip")]
    SkipDependents,
    /// The phase barrier alone governs; dependents run anyway.
    #[serde(rename = "proceed")]
    Proceed,
}

/// Runtime settings for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum live worker processes. Zero dispatches nothing.
    pub concurrency: usize,
    /// How long workers get to exit after `shutdown` before SIGKILL.
    pub shutdown_grace: Duration,
    /// Lifetime recovery attempts before a story is blocked.
    pub recovery_ceiling: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub dependency_policy: DependencyPolicy,
    /// Send `health_check` at this interval. `None` or zero disables health checks.
    pub health_check_interval: Option<Duration>,
    /// Kill a health-checked worker that has been silent this long.
    pub health_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            shutdown_grace: Duration::from_millis(5_000),
            recovery_ceiling: 10,
            backoff_initial: Duration::from_millis(1_000),
            backoff_max: Duration::from_millis(32_000),
            dependency_policy: DependencyPolicy::SkipDependents,
            health_check_interval: None,
            health_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Lifecycle events, delivered best-effort to an optional listener.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    PhaseStarted {
        index: usize,
        stories: Vec<StoryId>,
    },
    StoryStarted {
        story_id: StoryId,
        attempt: u32,
        pid: u32,
    },
    StoryProgress {
        story_id: StoryId,
        progress: Option<u8>,
        message: Option<String>,
    },
    StoryCompleted {
        story_id: StoryId,
        duration: Duration,
    },
    StoryFailed {
        story_id: StoryId,
        error: String,
    },
    RetryScheduled {
        story_id: StoryId,
        recovery_attempt: u32,
        delay: Duration,
    },
    StoryBlocked {
        story_id: StoryId,
        reason: String,
    },
    StorySkipped {
        story_id: StoryId,
        reason: String,
    },
    PhaseCompleted {
        index: usize,
        succeeded: usize,
        failed: usize,
    },
    AllPhasesComplete {
        succeeded: usize,
        failed: usize,
    },
}

/// What one worker conversation produced.
#[derive(Debug, Default)]
struct Session {
    completion: Option<ExecutionResult>,
    failure: Option<Failure>,
    last_error: Option<String>,
    fault: Option<String>,
    cancelled: bool,
}

/// Result of one dispatch.
#[derive(Debug)]
struct AttemptReport {
    result: ExecutionResult,
    failure: Option<Failure>,
}

enum TaskOutput {
    Attempt(AttemptReport),
    RetryDue(StoryId),
}

enum Recovery {
    Retry { delay: Duration, recovery_attempt: u32 },
    Blocked(String),
    GiveUp,
}

/// Cross-phase bookkeeping for one `execute` call.
#[derive(Default)]
struct RunState {
    succeeded: HashSet<StoryId>,
    unsatisfied: HashSet<StoryId>,
    results: Vec<ExecutionResult>,
}

/// Per-phase bookkeeping.
#[derive(Default)]
struct PhaseState {
    pending: VecDeque<Story>,
    dispatches: HashMap<StoryId, u32>,
    first_started: HashMap<StoryId, Instant>,
    awaiting_retry: HashMap<StoryId, ExecutionResult>,
    succeeded: usize,
    failed: usize,
}

/// Everything attempt tasks need, shared behind one `Arc`.
struct Shared {
    config: OrchestratorConfig,
    governor: ProcessGovernor,
    spawner: Arc<dyn WorkerSpawner>,
    store: Arc<dyn StoryStore>,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    breaker: RecoveryBreaker,
    events: Option<mpsc::Sender<OrchestratorEvent>>,
    cancel: CancellationToken,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    pool: Mutex<WorkerPool>,
    results: Mutex<Vec<ExecutionResult>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        governor: ProcessGovernor,
        spawner: Arc<dyn WorkerSpawner>,
        store: Arc<dyn StoryStore>,
        provisioner: Arc<dyn WorkspaceProvisioner>,
    ) -> Self {
        if config.concurrency == 0 {
            slog_warn!("Orchestrator created with concurrency 0; no story will be dispatched");
        }
        let pool = WorkerPool::new(config.concurrency);
        let breaker = RecoveryBreaker::new(config.recovery_ceiling);
        Self {
            shared: Arc::new(Shared {
                config,
                governor,
                spawner,
                store,
                provisioner,
                breaker,
                events: None,
                cancel: CancellationToken::new(),
            }),
            pool: Mutex::new(pool),
            results: Mutex::new(Vec::new()),
        }
    }

    /// Deliver lifecycle events to `tx`. Full channels drop events.
    pub fn with_events(mut self, tx: mpsc::Sender<OrchestratorEvent>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.events = Some(tx);
        }
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    pub fn governor(&self) -> &ProcessGovernor {
        &self.shared.governor
    }

    /// Token cancelled by `shutdown`; cancel it to stop dispatching.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Stories currently holding a worker slot.
    pub fn active_count(&self) -> usize {
        self.pool().active_count()
    }

    /// Every terminal result recorded so far, across `execute` calls.
    pub fn results(&self) -> Vec<ExecutionResult> {
        lock(&self.results).clone()
    }

    fn pool(&self) -> MutexGuard<'_, WorkerPool> {
        lock(&self.pool)
    }

    /// Stop dispatching and ask every worker to shut down over IPC.
    ///
    /// Workers get half the grace period to exit on their own; whatever is
    /// left is sent SIGTERM, then SIGKILL when the grace period runs out.
    /// Never fails, even when idle.
    pub async fn shutdown(&self) -> ShutdownReport {
        slog!("Orchestrator shutdown requested");
        self.shared.cancel.cancel();

        let governor = &self.shared.governor;
        let grace = self.shared.config.shutdown_grace;
        let started = Instant::now();
        let live = governor.active_count();
        let drained = tokio::time::timeout(grace / 2, async {
            while governor.active_count() > 0 {
                tokio::time::sleep(SHUTDOWN_POLL).await;
            }
        })
        .await
        .is_ok();
        if drained {
            slog_debug!("All workers exited after shutdown request");
        }

        let mut report = governor
            .kill_all_with_timeout(grace.saturating_sub(started.elapsed()))
            .await;
        report.graceful += live.saturating_sub(report.total());
        report
    }

    /// Run `stories` to completion, phase by phase.
    ///
    /// # Errors
    ///
    /// Fails before spawning anything on a missing dependency, a dependency
    /// cycle, or duplicate ids, and on store errors while loading the
    /// stories. Per-story failures are reported in the returned results.
    pub async fn execute(&self, stories: &[Story]) -> Result<Vec<ExecutionResult>> {
        if stories.is_empty() {
            return Ok(Vec::new());
        }

        let phases = group_stories_by_phase(stories)?;
        let mut current = self.load_current(stories).await?;
        slog!(
            "Executing {} stories in {} phase(s), concurrency {}",
            stories.len(),
            phases.len(),
            self.shared.config.concurrency
        );

        let mut run = RunState::default();
        let (pid_tx, mut pid_rx) = mpsc::unbounded_channel();

        for phase in &phases {
            let ids = phase.ids();
            if self.shared.cancel.is_cancelled() {
                for id in ids {
                    self.finish(&mut run, None, ExecutionResult::cancelled(id));
                }
                continue;
            }

            slog!("Phase {} started: {:?}", phase.index, ids);
            self.shared.emit(OrchestratorEvent::PhaseStarted {
                index: phase.index,
                stories: ids.clone(),
            });

            let mut state = PhaseState::default();
            for id in ids {
                let Some(story) = current.remove(&id) else {
                    continue;
                };
                match self.ineligible(&story, &run) {
                    Some(result) => self.finish(&mut run, Some(&mut state), result),
                    None if !story.status.is_dispatchable() => {
                        slog_debug!("{} is already done", story.id);
                        run.succeeded.insert(story.id);
                    }
                    None => state.pending.push_back(story),
                }
            }

            self.run_phase(&mut state, &mut run, &pid_tx, &mut pid_rx)
                .await;

            slog!(
                "Phase {} complete: {} succeeded, {} failed",
                phase.index,
                state.succeeded,
                state.failed
            );
            self.shared.emit(OrchestratorEvent::PhaseCompleted {
                index: phase.index,
                succeeded: state.succeeded,
                failed: state.failed,
            });
        }

        let succeeded = run.results.iter().filter(|r| r.success).count();
        self.shared.emit(OrchestratorEvent::AllPhasesComplete {
            succeeded,
            failed: run.results.len() - succeeded,
        });
        Ok(run.results)
    }

    /// Fresh copies of the stories from the store, seeding any it lacks.
    async fn load_current(&self, stories: &[Story]) -> Result<HashMap<StoryId, Story>> {
        let mut current = HashMap::with_capacity(stories.len());
        for story in stories {
            let stored = match self.shared.store.load(&story.id).await {
                Ok(stored) => stored,
                Err(Error::StoryNotFound(_)) => {
                    self.shared.store.save(story).await?;
                    story.clone()
                }
                Err(e) => return Err(e),
            };
            current.insert(story.id.clone(), stored);
        }
        Ok(current)
    }

    /// A terminal result for a story that must not be dispatched, if any.
    fn ineligible(&self, story: &Story, run: &RunState) -> Option<ExecutionResult> {
        if story.is_blocked() {
            let reason = story
                .blocked_reason
                .clone()
                .unwrap_or_else(|| "blocked".to_string());
            return Some(ExecutionResult::blocked(story.id.clone(), reason));
        }
        if !story.status.is_dispatchable()
            || self.shared.config.dependency_policy == DependencyPolicy::Proceed
        {
            return None;
        }
        story
            .dependencies
            .iter()
            .find(|dep| run.unsatisfied.contains(*dep))
            .map(|dep| {
                ExecutionResult::skipped(
                    story.id.clone(),
                    format!("dependency {} did not succeed", dep),
                )
            })
    }

    async fn run_phase(
        &self,
        state: &mut PhaseState,
        run: &mut RunState,
        pid_tx: &mpsc::UnboundedSender<(StoryId, u32)>,
        pid_rx: &mut mpsc::UnboundedReceiver<(StoryId, u32)>,
    ) {
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();

        loop {
            if self.shared.cancel.is_cancelled() {
                while let Some(story) = state.pending.pop_front() {
                    let result = self.cancelled_result(state, story.id);
                    self.finish(run, Some(state), result);
                }
            } else {
                self.dispatch_ready(state, &mut tasks, pid_tx);
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                Some((id, pid)) = pid_rx.recv() => self.pool().set_pid(&id, pid),
                Some(joined) = tasks.join_next() => match joined {
                    Ok(TaskOutput::Attempt(report)) => {
                        self.on_attempt(report, state, run, &mut tasks).await;
                    }
                    Ok(TaskOutput::RetryDue(id)) => self.on_retry_due(id, state, run).await,
                    Err(e) => slog_error!("Orchestrator task failed: {}", e),
                },
            }
        }

        // Anything still queued could not be dispatched (zero concurrency).
        while let Some(story) = state.pending.pop_front() {
            let result = ExecutionResult::skipped(
                story.id,
                "no worker slots available (concurrency is 0)",
            );
            self.finish(run, Some(state), result);
        }
    }

    fn dispatch_ready(
        &self,
        state: &mut PhaseState,
        tasks: &mut JoinSet<TaskOutput>,
        pid_tx: &mpsc::UnboundedSender<(StoryId, u32)>,
    ) {
        while let Some(story) = state.pending.front() {
            let attempt = state.dispatches.get(&story.id).copied().unwrap_or(0) + 1;
            {
                let mut pool = self.pool();
                match pool.claim(story.id.clone(), attempt) {
                    Ok(_) => {}
                    Err(Error::WorkerPoolFull { .. }) => return,
                    Err(e) => {
                        slog_error!("Cannot dispatch {}: {}", story.id, e);
                        return;
                    }
                }
            }
            let Some(story) = state.pending.pop_front() else {
                return;
            };

            state.dispatches.insert(story.id.clone(), attempt);
            state
                .first_started
                .entry(story.id.clone())
                .or_insert_with(Instant::now);
            slog!("Dispatching {} (attempt {})", story.id, attempt);

            let shared = Arc::clone(&self.shared);
            let pid_tx = pid_tx.clone();
            tasks.spawn(async move {
                let id = story.id.clone();
                let handle = tokio::spawn(shared.run_attempt(story, attempt, pid_tx));
                match handle.await {
                    Ok(report) => TaskOutput::Attempt(report),
                    Err(e) => TaskOutput::Attempt(AttemptReport {
                        result: ExecutionResult::failed(id, format!("attempt task failed: {}", e))
                            .with_attempts(attempt),
                        failure: None,
                    }),
                }
            });
        }
    }

    async fn on_attempt(
        &self,
        report: AttemptReport,
        state: &mut PhaseState,
        run: &mut RunState,
        tasks: &mut JoinSet<TaskOutput>,
    ) {
        let id = report.result.story_id.clone();
        self.pool().release(&id);
        let result = self.with_total_duration(state, report.result);

        if result.outcome != Outcome::Failed || self.shared.cancel.is_cancelled() {
            self.finish(run, Some(state), result);
            return;
        }

        let failure = report
            .failure
            .unwrap_or_else(|| Failure::other(result.error.clone().unwrap_or_default()));
        let dispatches = state.dispatches.get(&id).copied().unwrap_or(1);

        match self.recover(&id, &failure, dispatches).await {
            Recovery::Retry {
                delay,
                recovery_attempt,
            } => {
                slog!(
                    "Retrying {} in {:?} (recovery attempt {}/{}): {}",
                    id,
                    delay,
                    recovery_attempt,
                    self.shared.breaker.ceiling(),
                    failure
                );
                self.shared.emit(OrchestratorEvent::RetryScheduled {
                    story_id: id.clone(),
                    recovery_attempt,
                    delay,
                });
                state.awaiting_retry.insert(id.clone(), result);
                let cancel = self.shared.cancel.clone();
                tasks.spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {}
                    }
                    TaskOutput::RetryDue(id)
                });
            }
            Recovery::Blocked(reason) => {
                let result = result.into_outcome(Outcome::Blocked, Some(reason));
                self.finish(run, Some(state), result);
            }
            Recovery::GiveUp => self.finish(run, Some(state), result),
        }
    }

    /// Decide whether a failed story is re-dispatched.
    ///
    /// The breaker is consulted first: a story already at its ceiling is
    /// blocked whatever the failure. Otherwise transient failures record a
    /// recovery attempt and retry; permanent ones give up.
    async fn recover(&self, id: &StoryId, failure: &Failure, dispatches: u32) -> Recovery {
        let store = self.shared.store.as_ref();
        let breaker = &self.shared.breaker;

        let story = match store.load(id).await {
            Ok(story) => story,
            Err(e) => {
                slog_error!("Cannot load {} for recovery: {}", id, e);
                return Recovery::GiveUp;
            }
        };

        if breaker.is_at_limit(&story) {
            return match breaker.trip(store, id).await {
                Ok(blocked) => Recovery::Blocked(
                    blocked
                        .blocked_reason
                        .unwrap_or_else(|| breaker.reason(&story)),
                ),
                Err(e) => {
                    slog_error!("Cannot block {}: {}", id, e);
                    Recovery::Blocked(breaker.reason(&story))
                }
            };
        }

        if !is_transient(failure) {
            slog_debug!("Permanent failure for {}: {}", id, failure);
            return Recovery::GiveUp;
        }

        match breaker.record_recovery_attempt(store, id).await {
            Ok(updated) => Recovery::Retry {
                delay: backoff(
                    dispatches.saturating_sub(1),
                    self.shared.config.backoff_initial,
                    self.shared.config.backoff_max,
                ),
                recovery_attempt: updated.total_recovery_attempts,
            },
            Err(e) => {
                slog_error!("Cannot record recovery attempt for {}: {}", id, e);
                Recovery::GiveUp
            }
        }
    }

    async fn on_retry_due(&self, id: StoryId, state: &mut PhaseState, run: &mut RunState) {
        if self.shared.cancel.is_cancelled() {
            let result = self.cancelled_result(state, id);
            self.finish(run, Some(state), result);
            return;
        }
        match self.shared.store.load(&id).await {
            Ok(story) => {
                state.awaiting_retry.remove(&id);
                state.pending.push_front(story);
            }
            Err(e) => {
                slog_error!("Cannot reload {} for retry: {}", id, e);
                let result = state
                    .awaiting_retry
                    .remove(&id)
                    .unwrap_or_else(|| ExecutionResult::failed(id, e.to_string()));
                self.finish(run, Some(state), result);
            }
        }
    }

    fn cancelled_result(&self, state: &mut PhaseState, id: StoryId) -> ExecutionResult {
        let attempts = state.dispatches.get(&id).copied().unwrap_or(0);
        match state.awaiting_retry.remove(&id) {
            Some(last) => last.into_outcome(
                Outcome::Cancelled,
                Some("cancelled by shutdown".to_string()),
            ),
            None => ExecutionResult::cancelled(id).with_attempts(attempts),
        }
    }

    fn with_total_duration(&self, state: &PhaseState, result: ExecutionResult) -> ExecutionResult {
        match state.first_started.get(&result.story_id) {
            Some(started) => result.with_duration(started.elapsed()),
            None => result,
        }
    }

    /// Record a terminal result.
    fn finish(&self, run: &mut RunState, state: Option<&mut PhaseState>, result: ExecutionResult) {
        let id = result.story_id.clone();
        let event = match result.outcome {
            Outcome::Succeeded => OrchestratorEvent::StoryCompleted {
                story_id: id.clone(),
                duration: result.duration(),
            },
            Outcome::Blocked => OrchestratorEvent::StoryBlocked {
                story_id: id.clone(),
                reason: result.error.clone().unwrap_or_default(),
            },
            Outcome::Skipped => OrchestratorEvent::StorySkipped {
                story_id: id.clone(),
                reason: result.error.clone().unwrap_or_default(),
            },
            Outcome::Failed | Outcome::Cancelled => OrchestratorEvent::StoryFailed {
                story_id: id.clone(),
                error: result.error.clone().unwrap_or_default(),
            },
        };

        match result.outcome {
            Outcome::Succeeded => slog!("{} succeeded", id),
            outcome => slog_warn!(
                "{} finished {:?}: {}",
                id,
                outcome,
                result.error.as_deref().unwrap_or("")
            ),
        }

        if let Some(state) = state {
            if result.success {
                state.succeeded += 1;
            } else {
                state.failed += 1;
            }
        }
        if result.success {
            run.succeeded.insert(id);
        } else {
            run.unsatisfied.insert(id);
        }
        lock(&self.results).push(result.clone());
        run.results.push(result);
        self.shared.emit(event);
    }
}

impl Shared {
    fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.events {
            if tx.try_send(event).is_err() {
                slog_trace!("Orchestrator event dropped");
            }
        }
    }

    /// Provision, spawn, converse, and reap one worker.
    async fn run_attempt(
        self: Arc<Self>,
        story: Story,
        attempt: u32,
        pid_tx: mpsc::UnboundedSender<(StoryId, u32)>,
    ) -> AttemptReport {
        let id = story.id.clone();
        let started = Instant::now();
        let setup_failure = |message: String| {
            slog_error!("Attempt {} for {} failed to start: {}", attempt, id, message);
            AttemptReport {
                result: ExecutionResult::failed(id.clone(), message.clone())
                    .with_attempts(attempt)
                    .with_duration(started.elapsed()),
                failure: Some(Failure::other(message)),
            }
        };

        let workspace = match self.provisioner.provision(&story).await {
            Ok(path) => path,
            Err(e) => return setup_failure(format!("workspace provisioning failed: {}", e)),
        };
        let mut child = match self.spawner.spawn(&story, &workspace) {
            Ok(child) => child,
            Err(e) => return setup_failure(e.to_string()),
        };
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.start_kill();
                return setup_failure("worker spawned without piped stdio".to_string());
            }
        };
        let process = match self.governor.register(child) {
            Ok(process) => process,
            Err(e) => return setup_failure(e.to_string()),
        };

        let _ = pid_tx.send((id.clone(), process.pid()));
        self.emit(OrchestratorEvent::StoryStarted {
            story_id: id.clone(),
            attempt,
            pid: process.pid(),
        });

        let session = self.converse(&id, &process, stdin, stdout).await;

        let exit = match tokio::time::timeout(self.config.shutdown_grace, process.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                slog_warn!("Worker for {} closed its output but kept running; killing", id);
                self.governor.kill(process.pid());
                process.wait().await
            }
        };

        let Session {
            completion,
            failure,
            last_error,
            fault,
            cancelled,
        } = session;

        let (result, failure) = match completion {
            Some(done) if done.success && fault.is_none() => {
                (ExecutionResult::succeeded(id.clone()), None)
            }
            Some(done) => {
                let failure = failure.unwrap_or_else(|| {
                    Failure::other(
                        done.error
                            .clone()
                            .unwrap_or_else(|| "worker reported failure".to_string()),
                    )
                });
                (ExecutionResult::failed(id.clone(), failure.to_string()), Some(failure))
            }
            None => {
                self.reset_after_fault(&id).await;
                // The worker may die from the shutdown signal before the
                // cancellation branch of `converse` is polled.
                if cancelled || self.cancel.is_cancelled() {
                    (ExecutionResult::cancelled(id.clone()), None)
                } else {
                    let message = fault.or(last_error).unwrap_or_else(|| {
                        format!(
                            "worker exited without completing (code {:?}, signal {:?})",
                            exit.code, exit.signal
                        )
                    });
                    let failure = failure.unwrap_or_else(|| Failure::other(message.clone()));
                    (ExecutionResult::failed(id.clone(), message), Some(failure))
                }
            }
        };

        AttemptReport {
            result: result
                .with_exit(exit.code, exit.signal)
                .with_duration(started.elapsed())
                .with_attempts(attempt),
            failure,
        }
    }

    /// Exchange IPC messages with one worker until its output closes.
    async fn converse(
        &self,
        id: &StoryId,
        process: &TrackedProcess,
        stdin: ChildStdin,
        stdout: ChildStdout,
    ) -> Session {
        let mut reader = MessageReader::new(BufReader::new(stdout));
        let mut writer = MessageWriter::new(stdin);
        let mut session = Session::default();
        let mut kill_deadline: Option<tokio::time::Instant> = None;
        let mut health_checks = self
            .config
            .health_check_interval
            .filter(|period| !period.is_zero())
            .map(|period| tokio::time::interval_at(tokio::time::Instant::now() + period, period));
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled(), if !session.cancelled => {
                    session.cancelled = true;
                    slog_debug!("Sending shutdown to worker for {}", id);
                    if let Err(e) = writer.send(&IpcMessage::shutdown(id.clone())).await {
                        slog_debug!("Could not send shutdown to {}: {}", id, e);
                    }
                    kill_deadline = Some(tokio::time::Instant::now() + self.config.shutdown_grace);
                }
                _ = sleep_until(kill_deadline) => {
                    slog_warn!("Worker for {} ignored shutdown, force-killing", id);
                    self.governor.kill(process.pid());
                    kill_deadline = None;
                }
                _ = tick(&mut health_checks) => {
                    if last_seen.elapsed() >= self.config.health_timeout {
                        let reason = format!(
                            "worker unresponsive to health checks for {:?}",
                            self.config.health_timeout
                        );
                        slog_warn!("{}: {}", id, reason);
                        session.fault = Some(reason);
                        health_checks = None;
                        self.governor.kill(process.pid());
                    } else if let Err(e) = writer.send(&IpcMessage::health_check(id.clone())).await {
                        slog_debug!("Could not health-check {}: {}", id, e);
                    }
                }
                incoming = reader.next() => match incoming {
                    Ok(Some(message)) => {
                        last_seen = Instant::now();
                        self.handle_message(id, message, &mut session);
                    }
                    Ok(None) => break,
                    Err(Error::Protocol(e)) => slog_warn!("Bad message from worker for {}: {}", id, e),
                    Err(e) => {
                        slog_warn!("Reading from worker for {} failed: {}", id, e);
                        break;
                    }
                },
            }
        }
        session
    }

    fn handle_message(&self, id: &StoryId, msg: IpcMessage, session: &mut Session) {
        if &msg.story_id != id {
            slog_warn!(
                "Worker for {} sent a {} message for {}; ignored",
                id,
                msg.kind(),
                msg.story_id
            );
            return;
        }
        match msg.body {
            MessageBody::HealthResponse => slog_trace!("{} is healthy", id),
            MessageBody::StatusUpdate { progress, message } => {
                slog_debug!("{} progress {:?}: {:?}", id, progress, message);
                self.emit(OrchestratorEvent::StoryProgress {
                    story_id: id.clone(),
                    progress,
                    message,
                });
            }
            MessageBody::Error { message, failure } => {
                slog_warn!("Worker for {} reported: {}", id, message);
                session.failure = Some(failure.unwrap_or_else(|| Failure::other(message.clone())));
                session.last_error = Some(message);
            }
            MessageBody::Complete { result } => {
                if session.completion.is_some() {
                    slog_warn!("Worker for {} sent a second complete; ignored", id);
                } else {
                    session.completion = Some(result);
                }
            }
            MessageBody::HealthCheck | MessageBody::Shutdown => {
                slog_debug!("Worker for {} sent unexpected {}", id, msg.kind());
            }
        }
    }

    /// A worker that died mid-run leaves its story `in-progress`.
    async fn reset_after_fault(&self, id: &StoryId) {
        match self.store.load(id).await {
            Ok(story) if story.status == StoryStatus::InProgress => {
                if let Err(e) = self.store.set_status(id, StoryStatus::Ready).await {
                    slog_warn!("Could not reset {} to ready: {}", id, e);
                }
            }
            Ok(_) => {}
            Err(e) => slog_warn!("Could not reload {} after fault: {}", id, e),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
