//! Per-story workspace provisioning.
//!
//! Every dispatched story gets its own directory so that concurrently
//! running workers never touch each other's files. Worktree management
//! lives outside this crate; it plugs in through `WorkspaceProvisioner`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::core::Story;
use crate::{slog_debug, Result};

#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    /// Prepare the workspace for `story` and return its path.
    ///
    /// Called once per dispatch, before the worker is spawned.
    async fn provision(&self, story: &Story) -> Result<PathBuf>;
}

/// Creates `<root>/<story-id>` and reuses it across attempts.
#[derive(Debug, Clone)]
pub struct DirectoryProvisioner {
    root: PathBuf,
}

impl DirectoryProvisioner {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl WorkspaceProvisioner for DirectoryProvisioner {
    async fn provision(&self, story: &Story) -> Result<PathBuf> {
        let path = self.root.join(story.id.as_str());
        slog_debug!("Provisioning workspace {} for {}", path.display(), story.id);
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }
}
