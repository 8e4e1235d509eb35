//! IPC protocol between the orchestrator and worker processes.
//!
//! Messages travel as newline-delimited JSON: orchestrator to worker over the
//! worker's stdin, worker to orchestrator over its stdout. Every message
//! carries a `type` tag, the story id and a millisecond timestamp, with the
//! type-specific payload flattened alongside:
//!
//! ```text
//! {"story_id":"S-1","timestamp":1718000000000,"type":"status_update","progress":40}
//! {"story_id":"S-1","timestamp":1718000004000,"type":"complete","result":{...}}
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};

use crate::core::StoryId;
use crate::orchestration::classifier::Failure;
use crate::util::now_millis;
use crate::{Error, Result};

/// Terminal outcome of one story within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    /// Stopped by the recovery circuit breaker.
    Blocked,
    /// Not dispatched: a dependency failed, or the story was not eligible.
    Skipped,
    /// Interrupted by orchestrator shutdown.
    Cancelled,
}

/// Per-story result, produced when a worker exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub story_id: StoryId,
    pub success: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub signal: Option<i32>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Dispatches (orchestrator side) or executor runs (worker side).
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub outcome: Outcome,
}

impl ExecutionResult {
    fn with_outcome(story_id: StoryId, outcome: Outcome, error: Option<String>) -> Self {
        Self {
            story_id,
            success: outcome == Outcome::Succeeded,
            exit_code: None,
            signal: None,
            duration_ms: 0,
            attempts: 0,
            error,
            outcome,
        }
    }

    pub fn succeeded(story_id: StoryId) -> Self {
        Self::with_outcome(story_id, Outcome::Succeeded, None)
    }

    pub fn failed(story_id: StoryId, error: impl Into<String>) -> Self {
        Self::with_outcome(story_id, Outcome::Failed, Some(error.into()))
    }

    pub fn blocked(story_id: StoryId, reason: impl Into<String>) -> Self {
        Self::with_outcome(story_id, Outcome::Blocked, Some(reason.into()))
    }

    pub fn skipped(story_id: StoryId, reason: impl Into<String>) -> Self {
        Self::with_outcome(story_id, Outcome::Skipped, Some(reason.into()))
    }

    pub fn cancelled(story_id: StoryId) -> Self {
        Self::with_outcome(
            story_id,
            Outcome::Cancelled,
            Some("cancelled by shutdown".to_string()),
        )
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_exit(mut self, exit_code: Option<i32>, signal: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self.signal = signal;
        self
    }

    /// Replace the outcome, keeping exit, duration and attempts.
    pub fn into_outcome(mut self, outcome: Outcome, error: Option<String>) -> Self {
        self.outcome = outcome;
        self.success = outcome == Outcome::Succeeded;
        self.error = error;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Type-specific part of an IPC message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    /// Liveness check. No side effects on the worker.
    HealthCheck,
    HealthResponse,
    StatusUpdate {
        /// Coarse progress, 0-100.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<Failure>,
    },
    /// Final message of every worker.
    Complete { result: ExecutionResult },
    /// Exit now without finishing in-flight work.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcMessage {
    pub story_id: StoryId,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl IpcMessage {
    pub fn new(story_id: StoryId, body: MessageBody) -> Self {
        Self {
            story_id,
            timestamp: now_millis(),
            body,
        }
    }

    pub fn health_check(story_id: StoryId) -> Self {
        Self::new(story_id, MessageBody::HealthCheck)
    }

    pub fn health_response(story_id: StoryId) -> Self {
        Self::new(story_id, MessageBody::HealthResponse)
    }

    pub fn status_update(story_id: StoryId, progress: Option<u8>, message: Option<String>) -> Self {
        Self::new(
            story_id,
            MessageBody::StatusUpdate {
                progress: progress.map(|p| p.min(100)),
                message,
            },
        )
    }

    pub fn error(story_id: StoryId, message: impl Into<String>, failure: Option<Failure>) -> Self {
        Self::new(
            story_id,
            MessageBody::Error {
                message: message.into(),
                failure,
            },
        )
    }

    pub fn complete(result: ExecutionResult) -> Self {
        Self::new(result.story_id.clone(), MessageBody::Complete { result })
    }

    pub fn shutdown(story_id: StoryId) -> Self {
        Self::new(story_id, MessageBody::Shutdown)
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self.body {
            MessageBody::HealthCheck => "health_check",
            MessageBody::HealthResponse => "health_response",
            MessageBody::StatusUpdate { .. } => "status_update",
            MessageBody::Error { .. } => "error",
            MessageBody::Complete { .. } => "complete",
            MessageBody::Shutdown => "shutdown",
        }
    }
}

/// Serialize a message as one NDJSON line, newline included.
pub fn encode(message: &IpcMessage) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one NDJSON line.
///
/// # Errors
///
/// `Error::Protocol` naming the offending line if it is not a valid message.
pub fn decode(line: &str) -> Result<IpcMessage> {
    serde_json::from_str(line.trim())
        .map_err(|e| Error::Protocol(format!("{} in line: {}", e, truncate(line.trim(), 200))))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Reads messages from a line-oriented stream, skipping blank lines.
pub struct MessageReader<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    /// Next message, or `None` at end of stream.
    ///
    /// Cancel safe: dropping the future loses no data.
    pub async fn next(&mut self) -> Result<Option<IpcMessage>> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            return decode(&line).map(Some);
        }
        Ok(None)
    }
}

/// Writes messages to a stream, one flushed line each.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, message: &IpcMessage) -> Result<()> {
        let line = encode(message)?;
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
