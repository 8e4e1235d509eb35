//! Story executors.
//!
//! A `StoryExecutor` does the actual work of one story inside its workspace.
//! The worker process drives exactly one executor; the default
//! `CommandExecutor` shells out to the configured coding agent.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::WorkerSettings;
use crate::core::Story;
use crate::orchestration::Failure;
use crate::{slog_debug, Error, Result};

/// Default timeout for one agent run (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Coarse progress reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProgressUpdate {
    pub progress: Option<u8>,
    pub message: Option<String>,
}

impl ProgressUpdate {
    pub fn new(progress: u8, message: impl Into<String>) -> Self {
        Self {
            progress: Some(progress),
            message: Some(message.into()),
        }
    }
}

pub type ProgressSender = mpsc::UnboundedSender<ProgressUpdate>;

#[async_trait]
pub trait StoryExecutor: Send + Sync {
    /// Run the story once.
    ///
    /// Progress sends are fire-and-forget; a closed channel is not an error.
    async fn execute(
        &self,
        story: &Story,
        workspace: &Path,
        progress: &ProgressSender,
    ) -> std::result::Result<(), Failure>;
}

/// Runs the configured agent command with the story prompt appended.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    base_command: Vec<String>,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(command: &str) -> Self {
        Self {
            base_command: command.split_whitespace().map(String::from).collect(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self::new(settings.effective_command())
            .with_timeout(Duration::from_secs(settings.agent_timeout_secs))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn binary(&self) -> &str {
        self.base_command
            .first()
            .map(|s| s.as_str())
            .unwrap_or("claude")
    }

    pub fn command(&self, prompt: Option<&str>) -> Vec<String> {
        let mut cmd = self.base_command.clone();
        if cmd.is_empty() {
            cmd.push(self.binary().to_string());
        }
        if let Some(p) = prompt {
            cmd.push(p.to_string());
        }
        cmd
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }

    /// Fail fast when the agent binary cannot be resolved.
    ///
    /// # Errors
    ///
    /// Returns `Error::AgentNotFound` naming the binary.
    pub fn check_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::AgentNotFound(self.binary().to_string()))
        }
    }

    pub fn prompt(story: &Story) -> String {
        if story.title.is_empty() {
            format!("Implement story {}.", story.id)
        } else {
            format!("Implement story {}: {}", story.id, story.title)
        }
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::from_settings(&WorkerSettings::default())
    }
}

#[async_trait]
impl StoryExecutor for CommandExecutor {
    async fn execute(
        &self,
        story: &Story,
        workspace: &Path,
        progress: &ProgressSender,
    ) -> std::result::Result<(), Failure> {
        // A missing agent never fixes itself between retries.
        self.check_available()
            .map_err(|e| Failure::other(e.to_string()))?;

        let argv = self.command(Some(&Self::prompt(story)));
        slog_debug!("Running agent for {}: {:?}", story.id, argv);
        let _ = progress.send(ProgressUpdate::new(10, format!("running {}", self.binary())));

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&argv[0])
                .args(&argv[1..])
                .current_dir(workspace)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            Failure::transport(
                "ETIMEDOUT",
                format!("agent timed out after {:?}", self.timeout),
            )
        })?
        .map_err(|e| Failure::from_io(&e))?;

        if output.status.success() {
            let _ = progress.send(ProgressUpdate::new(100, "agent finished"));
            return Ok(());
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push('\n');
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(Failure::from_output(output.status.code(), &combined))
    }
}
