//! Worker-side protocol state machine.
//!
//! A worker process executes exactly one story:
//!
//! ```text
//! Starting -> Running -> Completed { success } | Crashed
//! ```
//!
//! It reads orchestrator messages from stdin, writes its own to stdout, and
//! always ends a non-shutdown run with exactly one `complete` message.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;

use crate::agent::{ProgressUpdate, StoryExecutor};
use crate::core::{Story, StoryId, StoryStatus};
use crate::orchestration::classifier::{backoff, should_retry, Failure};
use crate::orchestration::protocol::{
    ExecutionResult, IpcMessage, MessageBody, MessageReader, MessageWriter,
};
use crate::store::StoryStore;
use crate::{slog, slog_debug, slog_error, slog_warn, Error, Result};

/// Environment fallback for the worker's story id.
pub const STORY_ID_ENV: &str = "STORYRUN_STORY_ID";
/// Environment variable carrying the worker's workspace path.
pub const WORKSPACE_ENV: &str = "STORYRUN_WORKSPACE";

/// Resolve the story id from an explicit argument, else the environment
/// value. Empty strings count as absent.
///
/// # Errors
///
/// `Error::MissingStoryId` if neither is present.
pub fn resolve_story_id(arg: Option<&str>, env: Option<&str>) -> Result<StoryId> {
    arg.filter(|s| !s.trim().is_empty())
        .or_else(|| env.filter(|s| !s.trim().is_empty()))
        .map(|s| StoryId::from(s.trim()))
        .ok_or(Error::MissingStoryId(STORY_ID_ENV))
}

/// `resolve_story_id` against the process environment.
pub fn resolve_story_id_from_env(arg: Option<&str>) -> Result<StoryId> {
    let env = std::env::var(STORY_ID_ENV).ok();
    resolve_story_id(arg, env.as_deref())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Completed { success: bool },
    Crashed,
}

/// Internal retry policy for the executor.
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub max_retries: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_initial: Duration::from_millis(1_000),
            backoff_max: Duration::from_millis(32_000),
        }
    }
}

/// Result of the executor task: the last outcome and how many runs it took.
struct Attempted {
    result: std::result::Result<(), Failure>,
    attempts: u32,
}

async fn execute_with_retries(
    executor: Arc<dyn StoryExecutor>,
    story: Story,
    workspace: PathBuf,
    options: WorkerOptions,
    progress: mpsc::UnboundedSender<ProgressUpdate>,
) -> Attempted {
    let mut attempt = 0;
    loop {
        match executor.execute(&story, &workspace, &progress).await {
            Ok(()) => {
                return Attempted {
                    result: Ok(()),
                    attempts: attempt + 1,
                }
            }
            Err(failure) if should_retry(&failure, attempt, options.max_retries) => {
                let delay = backoff(attempt, options.backoff_initial, options.backoff_max);
                slog_warn!(
                    "Transient failure on {} (attempt {}): {}; retrying in {:?}",
                    story.id,
                    attempt + 1,
                    failure,
                    delay
                );
                let _ = progress.send(ProgressUpdate {
                    progress: None,
                    message: Some(format!(
                        "retry {}/{} in {}ms after: {}",
                        attempt + 1,
                        options.max_retries,
                        delay.as_millis(),
                        failure
                    )),
                });
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(failure) => {
                return Attempted {
                    result: Err(failure),
                    attempts: attempt + 1,
                }
            }
        }
    }
}

/// Executes one story and speaks the worker side of the IPC protocol.
pub struct Worker {
    story_id: StoryId,
    workspace: PathBuf,
    store: Arc<dyn StoryStore>,
    executor: Arc<dyn StoryExecutor>,
    options: WorkerOptions,
    state: WorkerState,
}

impl Worker {
    pub fn new(
        story_id: StoryId,
        workspace: PathBuf,
        store: Arc<dyn StoryStore>,
        executor: Arc<dyn StoryExecutor>,
    ) -> Self {
        Self {
            story_id,
            workspace,
            store,
            executor,
            options: WorkerOptions::default(),
            state: WorkerState::Starting,
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn story_id(&self) -> &StoryId {
        &self.story_id
    }

    /// Run over the process's stdin/stdout.
    pub async fn run_stdio(&mut self) -> i32 {
        self.run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Run the story, returning the process exit code.
    ///
    /// `0` after success or an orchestrator `shutdown`, `1` otherwise.
    /// End of input is treated as `shutdown`: the orchestrator is gone.
    pub async fn run<R, W>(&mut self, input: R, output: W) -> i32
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut reader = MessageReader::new(input);
        let mut writer = MessageWriter::new(output);
        let started = Instant::now();
        self.state = WorkerState::Starting;

        let story = match self.store.set_status(&self.story_id, StoryStatus::InProgress).await {
            Ok(story) => story,
            Err(e) => {
                let message = format!("failed to start story: {}", e);
                return self.crash(&mut writer, message, None, 0, started).await;
            }
        };

        self.state = WorkerState::Running;
        slog!("Worker started for {} in {}", self.story_id, self.workspace.display());

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let mut exec_task = tokio::spawn(execute_with_retries(
            Arc::clone(&self.executor),
            story,
            self.workspace.clone(),
            self.options,
            progress_tx,
        ));
        let mut input_open = true;

        let joined = loop {
            tokio::select! {
                joined = &mut exec_task => break joined,
                Some(update) = progress_rx.recv() => {
                    self.send_progress(&mut writer, update).await;
                }
                incoming = reader.next(), if input_open => match incoming {
                    Ok(Some(message)) => match message.body {
                        MessageBody::HealthCheck => {
                            let reply = IpcMessage::health_response(self.story_id.clone());
                            self.send(&mut writer, &reply).await;
                        }
                        MessageBody::Shutdown => {
                            slog!("Shutdown requested for {}, exiting", self.story_id);
                            exec_task.abort();
                            self.state = WorkerState::Completed { success: false };
                            return 0;
                        }
                        MessageBody::HealthResponse
                        | MessageBody::StatusUpdate { .. }
                        | MessageBody::Error { .. }
                        | MessageBody::Complete { .. } => {
                            slog_debug!("Worker ignoring unexpected {} message", message.kind());
                        }
                    },
                    Ok(None) => {
                        slog_warn!("Orchestrator closed stdin for {}, exiting", self.story_id);
                        exec_task.abort();
                        self.state = WorkerState::Completed { success: false };
                        return 0;
                    }
                    Err(Error::Protocol(e)) => slog_warn!("Worker dropped malformed input: {}", e),
                    Err(e) => {
                        slog_warn!("Worker input failed, no longer listening: {}", e);
                        input_open = false;
                    }
                },
            }
        };

        while let Ok(update) = progress_rx.try_recv() {
            self.send_progress(&mut writer, update).await;
        }

        let attempted = match joined {
            Ok(attempted) => attempted,
            Err(join_error) => {
                let message = format!("executor crashed: {}", join_error);
                self.reset_status().await;
                return self.crash(&mut writer, message, None, 1, started).await;
            }
        };

        match attempted.result {
            Ok(()) => {
                if let Err(e) = self.store.set_status(&self.story_id, StoryStatus::Done).await {
                    let message = format!("story finished but could not be marked done: {}", e);
                    return self
                        .crash(&mut writer, message, None, attempted.attempts, started)
                        .await;
                }
                let result = ExecutionResult::succeeded(self.story_id.clone())
                    .with_attempts(attempted.attempts)
                    .with_duration(started.elapsed())
                    .with_exit(Some(0), None);
                self.send(&mut writer, &IpcMessage::complete(result)).await;
                self.state = WorkerState::Completed { success: true };
                slog!("Worker completed {} after {} attempt(s)", self.story_id, attempted.attempts);
                0
            }
            Err(failure) => {
                self.reset_status().await;
                let error = IpcMessage::error(
                    self.story_id.clone(),
                    failure.message.clone(),
                    Some(failure.clone()),
                );
                self.send(&mut writer, &error).await;
                let result = ExecutionResult::failed(self.story_id.clone(), failure.to_string())
                    .with_attempts(attempted.attempts)
                    .with_duration(started.elapsed())
                    .with_exit(Some(1), None);
                self.send(&mut writer, &IpcMessage::complete(result)).await;
                self.state = WorkerState::Completed { success: false };
                slog_warn!("Worker failed {}: {}", self.story_id, failure);
                1
            }
        }
    }

    /// Report an unhandled fault: `error`, then `complete(success=false)`.
    async fn crash<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut MessageWriter<W>,
        message: String,
        failure: Option<Failure>,
        attempts: u32,
        started: Instant,
    ) -> i32 {
        slog_error!("Worker fault on {}: {}", self.story_id, message);
        let error = IpcMessage::error(self.story_id.clone(), message.clone(), failure);
        self.send(writer, &error).await;
        let result = ExecutionResult::failed(self.story_id.clone(), message)
            .with_attempts(attempts)
            .with_duration(started.elapsed())
            .with_exit(Some(1), None);
        self.send(writer, &IpcMessage::complete(result)).await;
        self.state = WorkerState::Crashed;
        1
    }

    async fn reset_status(&self) {
        if let Err(e) = self.store.set_status(&self.story_id, StoryStatus::Ready).await {
            slog_warn!("Could not reset {} to ready: {}", self.story_id, e);
        }
    }

    async fn send_progress<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut MessageWriter<W>,
        update: ProgressUpdate,
    ) {
        let message = IpcMessage::status_update(self.story_id.clone(), update.progress, update.message);
        self.send(writer, &message).await;
    }

    async fn send<W: AsyncWrite + Unpin>(&self, writer: &mut MessageWriter<W>, message: &IpcMessage) {
        if let Err(e) = writer.send(message).await {
            slog_warn!("Worker could not send {}: {}", message.kind(), e);
        }
    }
}
