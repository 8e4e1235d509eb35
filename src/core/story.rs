//! Story data model.
//!
//! Stories are the units of work delegated to worker processes. Each story
//! carries its lifecycle status, its dependency ids, and the lifetime count
//! of automatic recovery attempts made on its behalf.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a story, unique within a store.
///
/// Story ids are human-assigned (e.g. `"S-12"`), so this wraps a `String`
/// rather than generating UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoryId(pub String);

impl StoryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StoryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StoryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for StoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StoryStatus {
    #[default]
    Backlog,
    Ready,
    InProgress,
    Blocked,
    Done,
}

impl StoryStatus {
    /// Whether a story in this status may be handed to a worker.
    pub fn is_dispatchable(&self) -> bool {
        matches!(
            self,
            StoryStatus::Backlog | StoryStatus::Ready | StoryStatus::InProgress
        )
    }
}

impl std::fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoryStatus::Backlog => write!(f, "backlog"),
            StoryStatus::Ready => write!(f, "ready"),
            StoryStatus::InProgress => write!(f, "in-progress"),
            StoryStatus::Blocked => write!(f, "blocked"),
            StoryStatus::Done => write!(f, "done"),
        }
    }
}

/// A single unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    /// Unique identifier for this story.
    pub id: StoryId,
    /// Short human-readable title, handed to the agent.
    #[serde(default)]
    pub title: String,
    /// Current lifecycle status.
    #[serde(default)]
    pub status: StoryStatus,
    /// Stories that must complete before this one can start, in declared order.
    #[serde(default)]
    pub dependencies: Vec<StoryId>,
    /// Automatic recovery attempts across the story's whole lifetime.
    ///
    /// Only ever reset by an explicit unblock.
    #[serde(default)]
    pub total_recovery_attempts: u32,
    /// Why the story is blocked, if it is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    /// Last time any field was written through a store.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Story {
    /// Create a new story in `ready` status with no dependencies.
    pub fn new(id: impl Into<StoryId>, title: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            status: StoryStatus::Ready,
            dependencies: Vec::new(),
            total_recovery_attempts: 0,
            blocked_reason: None,
            updated_at: Utc::now(),
        }
    }

    /// Builder-style helper to declare dependencies.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StoryId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_status(mut self, status: StoryStatus) -> Self {
        self.status = status;
        self
    }

    pub fn set_status(&mut self, status: StoryStatus) {
        self.status = status;
        if status != StoryStatus::Blocked {
            self.blocked_reason = None;
        }
        self.touch();
    }

    /// Move the story to `blocked`, recording why.
    pub fn block(&mut self, reason: &str) {
        self.status = StoryStatus::Blocked;
        self.blocked_reason = Some(reason.to_string());
        self.touch();
    }

    pub fn is_blocked(&self) -> bool {
        self.status == StoryStatus::Blocked
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
