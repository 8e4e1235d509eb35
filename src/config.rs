use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::orchestration::{DependencyPolicy, OrchestratorConfig};
use crate::{slog_debug, Error, Result};

/// Environment variable overriding the storyrun home directory.
pub const HOME_ENV: &str = "STORYRUN_HOME";

/// Environment variable overriding the story store directory. The
/// orchestrator sets it for its workers so both sides share one store.
pub const STORE_DIR_ENV: &str = "STORYRUN_STORE_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub store_dir: Option<String>,
    pub workspace_dir: Option<String>,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub concurrency: usize,
    pub shutdown_grace_ms: u64,
    pub recovery_ceiling: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub failed_dependency: DependencyPolicy,
    /// `None` or `0` disables health checks.
    pub health_check_interval_ms: Option<u64>,
    pub health_timeout_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            shutdown_grace_ms: 5_000,
            recovery_ceiling: 10,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 32_000,
            failed_dependency: DependencyPolicy::default(),
            health_check_interval_ms: None,
            health_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub max_retries: u32,
    pub agent_command: Option<String>,
    pub agent_timeout_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            agent_command: None,
            agent_timeout_secs: 600,
        }
    }
}

impl WorkerSettings {
    pub fn effective_command(&self) -> &str {
        self.agent_command.as_deref().unwrap_or("claude -p")
    }
}

impl Config {
    pub fn home_dir() -> Result<PathBuf> {
        if let Ok(home) = std::env::var(HOME_ENV) {
            if !home.is_empty() {
                return Ok(expand_tilde(&home));
            }
        }
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".storyrun"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::home_dir()?.join("storyrun.toml"))
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        if let Ok(dir) = std::env::var(STORE_DIR_ENV) {
            if !dir.is_empty() {
                return Ok(expand_tilde(&dir));
            }
        }
        match &self.store_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::home_dir()?.join("stories")),
        }
    }

    pub fn workspaces_path(&self) -> Result<PathBuf> {
        match &self.workspace_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::home_dir()?.join("workspaces")),
        }
    }

    /// Runtime settings consumed by the orchestrator.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let s = &self.orchestrator;
        OrchestratorConfig {
            concurrency: s.concurrency,
            shutdown_grace: Duration::from_millis(s.shutdown_grace_ms),
            recovery_ceiling: s.recovery_ceiling,
            backoff_initial: Duration::from_millis(s.backoff_initial_ms),
            backoff_max: Duration::from_millis(s.backoff_max_ms),
            dependency_policy: s.failed_dependency,
            health_check_interval: s
                .health_check_interval_ms
                .filter(|&ms| ms > 0)
                .map(Duration::from_millis),
            health_timeout: Duration::from_millis(s.health_timeout_ms),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        slog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            slog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        slog_debug!(
            "Config loaded: concurrency={}, recovery_ceiling={}, store_dir={:?}",
            config.orchestrator.concurrency,
            config.orchestrator.recovery_ceiling,
            config.store_dir
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let home = Self::home_dir()?;
        if !home.exists() {
            slog_debug!("Creating storyrun directory: {}", home.display());
            fs::create_dir_all(&home)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        slog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
