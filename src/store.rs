//! Story persistence.
//!
//! The orchestrator and workers only talk to stories through the
//! `StoryStore` trait. Two implementations ship with the crate: an in-memory
//! store for tests and embedding, and a directory of JSON files shared
//! between the orchestrator and its worker processes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::{Story, StoryId, StoryStatus};
use crate::util::{blocking, write_atomic};
use crate::{slog_debug, Error, Result};

#[async_trait]
pub trait StoryStore: Send + Sync {
    /// Load a story by id.
    ///
    /// # Errors
    /// `StoryNotFound` if no story has that id.
    async fn load(&self, id: &StoryId) -> Result<Story>;

    /// Insert or overwrite a story.
    async fn save(&self, story: &Story) -> Result<()>;

    /// All stories, ordered by id.
    async fn list(&self) -> Result<Vec<Story>>;

    /// Load, change the status, and save.
    async fn set_status(&self, id: &StoryId, status: StoryStatus) -> Result<Story> {
        let mut story = self.load(id).await?;
        story.set_status(status);
        self.save(&story).await?;
        Ok(story)
    }
}

/// In-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStoryStore {
    stories: Arc<RwLock<HashMap<StoryId, Story>>>,
}

impl MemoryStoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `stories`.
    pub fn with_stories(stories: impl IntoIterator<Item = Story>) -> Self {
        let map = stories.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self {
            stories: Arc::new(RwLock::new(map)),
        }
    }
}

#[async_trait]
impl StoryStore for MemoryStoryStore {
    async fn load(&self, id: &StoryId) -> Result<Story> {
        self.stories
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::StoryNotFound(id.clone()))
    }

    async fn save(&self, story: &Story) -> Result<()> {
        self.stories
            .write()
            .await
            .insert(story.id.clone(), story.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Story>> {
        let mut stories: Vec<Story> = self.stories.read().await.values().cloned().collect();
        stories.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(stories)
    }
}

/// Directory of `<story-id>.json` files.
///
/// Writes go through a temp file and rename, so a worker process and the
/// orchestrator never observe a torn record.
#[derive(Debug, Clone)]
pub struct JsonStoryStore {
    dir: PathBuf,
}

impl JsonStoryStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &StoryId) -> Result<PathBuf> {
        let name = id.as_str();
        if name.is_empty()
            || name.contains(['/', '\\'])
            || name == "."
            || name == ".."
        {
            return Err(Error::Validation(format!(
                "story id '{}' cannot be used as a file name",
                name
            )));
        }
        Ok(self.dir.join(format!("{}.json", name)))
    }
}

#[async_trait]
impl StoryStore for JsonStoryStore {
    async fn load(&self, id: &StoryId) -> Result<Story> {
        let path = self.path_for(id)?;
        let id = id.clone();
        blocking(move || {
            if !path.exists() {
                return Err(Error::StoryNotFound(id));
            }
            let contents = fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        })
        .await
    }

    async fn save(&self, story: &Story) -> Result<()> {
        let path = self.path_for(&story.id)?;
        let contents = serde_json::to_string_pretty(story)?;
        slog_debug!(
            "JsonStoryStore::save id={} status={} recovery_attempts={}",
            story.id,
            story.status,
            story.total_recovery_attempts
        );
        blocking(move || write_atomic(&path, &contents)).await
    }

    async fn list(&self) -> Result<Vec<Story>> {
        let dir = self.dir.clone();
        blocking(move || {
            let mut stories = Vec::new();
            if !dir.exists() {
                return Ok(stories);
            }
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let story: Story = serde_json::from_str(&fs::read_to_string(&path)?)?;
                stories.push(story);
            }
            stories.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(stories)
        })
        .await
    }
}
