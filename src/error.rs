use thiserror::Error;

use crate::core::StoryId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Missing dependency: story '{story}' depends on unknown story '{dependency}'")]
    MissingDependency { story: StoryId, dependency: StoryId },

    #[error("Dependency cycle detected: {}", render_path(.path))]
    DependencyCycle { path: Vec<StoryId> },

    #[error("Story not found: {0}")]
    StoryNotFound(StoryId),

    #[error("Story already has a live worker: {0}")]
    StoryAlreadyActive(StoryId),

    #[error("No story id given: pass it as the first argument or set {0}")]
    MissingStoryId(&'static str),

    #[error("Agent binary '{0}' not found in PATH")]
    AgentNotFound(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("IPC protocol error: {0}")]
    Protocol(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Worker pool is full (max: {max})")]
    WorkerPoolFull { max: usize },
}

fn render_path(path: &[StoryId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
