//! Worker process spawning.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::core::Story;
use crate::orchestration::worker::{STORY_ID_ENV, WORKSPACE_ENV};
use crate::{slog_debug, Error, Result};

/// Starts one worker process for one story.
///
/// Implementations must pipe the child's stdin and stdout; they carry the
/// IPC stream. Stderr is left to the implementation.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, story: &Story, workspace: &Path) -> Result<Child>;
}

/// Spawns `<program> <args...> <story-id>` inside the story's workspace.
///
/// The story id is also exported as `STORYRUN_STORY_ID` and the workspace
/// as `STORYRUN_WORKSPACE`, so scripts that ignore arguments still work.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    pass_story_id_arg: bool,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            pass_story_id_arg: true,
        }
    }

    /// Re-invoke the current executable as `storyrun worker <id>`.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Leave the story id out of the argument list; workers then resolve it
    /// from the environment.
    pub fn without_story_id_arg(mut self) -> Self {
        self.pass_story_id_arg = false;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, story: &Story, workspace: &Path) -> Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if self.pass_story_id_arg {
            cmd.arg(story.id.as_str());
        }
        cmd.current_dir(workspace)
            .env(STORY_ID_ENV, story.id.as_str())
            .env(WORKSPACE_ENV, workspace)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        slog_debug!(
            "Spawning worker for {}: {} {:?} in {}",
            story.id,
            self.program.display(),
            self.args,
            workspace.display()
        );

        cmd.spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", self.program.display(), e)))
    }
}
