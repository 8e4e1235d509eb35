//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Script-driven fake workers (`/bin/sh`) that speak the IPC protocol
//! - An orchestrator harness over an in-memory store and temp workspaces
//! - Reading back the event log the fake workers append to

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use storyrun::core::{Story, StoryId};
use storyrun::orchestration::{
    encode, CommandSpawner, ExecutionResult, Failure, IpcMessage, Orchestrator,
    OrchestratorConfig, OrchestratorEvent, ProcessGovernor,
};
use storyrun::store::MemoryStoryStore;
use storyrun::workspace::DirectoryProvisioner;

/// How a fake worker behaves for one story.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Sleep briefly, report progress, complete successfully.
    Succeed,
    /// Report `failure` and complete unsuccessfully, every time.
    Fail(Failure),
    /// Fail with `failure` on the first `n` dispatches, then succeed.
    FailTimes(u32, Failure),
    /// Exit with `code` without ever sending `complete`.
    Crash(i32),
    /// Wait for the orchestrator's `shutdown`, then exit 0.
    AwaitShutdown,
    /// Ignore SIGTERM and every message; only SIGKILL stops it.
    Hang,
}

/// Builds a `/bin/sh` worker script with per-story behavior.
///
/// Each run appends `start <id>` and `end <id>` lines to `events.log` in
/// the fixture directory, so tests can check ordering and overlap.
pub struct FakeWorkers {
    dir: TempDir,
    behaviors: HashMap<String, Behavior>,
    default: Behavior,
    work_time: Duration,
}

impl FakeWorkers {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create fixture directory"),
            behaviors: HashMap::new(),
            default: Behavior::Succeed,
            work_time: Duration::from_millis(50),
        }
    }

    pub fn with(mut self, id: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(id.to_string(), behavior);
        self
    }

    pub fn with_work_time(mut self, work_time: Duration) -> Self {
        self.work_time = work_time;
        self
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.path().join("events.log")
    }

    /// Lines of the event log, e.g. `["start A", "end A"]`.
    pub fn log(&self) -> Vec<String> {
        std::fs::read_to_string(self.log_path())
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    /// How many times `id` was started.
    pub fn starts(&self, id: &str) -> usize {
        let needle = format!("start {}", id);
        self.log().iter().filter(|l| **l == needle).count()
    }

    /// Largest number of stories running at once, per the event log.
    pub fn peak_concurrency(&self) -> usize {
        let mut live = 0usize;
        let mut peak = 0usize;
        for line in self.log() {
            if line.starts_with("start ") {
                live += 1;
                peak = peak.max(live);
            } else if line.starts_with("end ") {
                live = live.saturating_sub(1);
            }
        }
        peak
    }

    /// Position of `line` in the event log.
    pub fn position(&self, line: &str) -> Option<usize> {
        self.log().iter().position(|l| l == line)
    }

    /// A spawner that runs the generated script for the given stories.
    pub fn spawner(&self, ids: &[&str]) -> CommandSpawner {
        CommandSpawner::new("sh")
            .arg("-c")
            .arg(self.script(ids))
            .arg("fake-worker")
    }

    fn script(&self, ids: &[&str]) -> String {
        let log = self.log_path();
        let mut script = String::new();
        script.push_str(&format!(
            "ID=\"$STORYRUN_STORY_ID\"\nLOG='{}'\necho \"start $ID\" >> \"$LOG\"\ncase \"$ID\" in\n",
            log.display()
        ));
        for id in ids {
            let behavior = self.behaviors.get(*id).unwrap_or(&self.default);
            script.push_str(&format!("'{}')\n{}\n;;\n", id, self.branch(id, behavior)));
        }
        script.push_str("esac\n");
        script
    }

    fn branch(&self, id: &str, behavior: &Behavior) -> String {
        let sleep = format!("sleep {:.3}", self.work_time.as_secs_f64());
        let end = "echo \"end $ID\" >> \"$LOG\"".to_string();
        match behavior {
            Behavior::Succeed => self.succeed(id, &sleep, &end),
            Behavior::Fail(failure) => self.fail(id, failure, &sleep, &end),
            Behavior::FailTimes(n, failure) => {
                let counter = self.dir.path().join(format!("{}.count", id));
                format!(
                    "N=$(cat '{c}' 2>/dev/null || echo 0)\nN=$((N+1))\necho $N > '{c}'\nif [ $N -le {n} ]; then\n{fail}\nfi\n{ok}",
                    c = counter.display(),
                    n = n,
                    fail = self.fail(id, failure, &sleep, &end),
                    ok = self.succeed(id, &sleep, &end),
                )
            }
            Behavior::Crash(code) => format!("{}\n{}\nexit {}", sleep, end, code),
            Behavior::AwaitShutdown => format!("read line\n{}\nexit 0", end),
            Behavior::Hang => "trap '' TERM\nexec sleep 30".to_string(),
        }
    }

    fn succeed(&self, id: &str, sleep: &str, end: &str) -> String {
        let story_id = StoryId::from(id);
        let progress = IpcMessage::status_update(
            story_id.clone(),
            Some(50),
            Some("halfway".to_string()),
        );
        let done = IpcMessage::complete(ExecutionResult::succeeded(story_id).with_attempts(1));
        format!(
            "{}\n{}\n{}\n{}\nexit 0",
            emit(&progress),
            sleep,
            end,
            emit(&done)
        )
    }

    fn fail(&self, id: &str, failure: &Failure, sleep: &str, end: &str) -> String {
        let story_id = StoryId::from(id);
        let error = IpcMessage::error(story_id.clone(), failure.message.clone(), Some(failure.clone()));
        let done = IpcMessage::complete(
            ExecutionResult::failed(story_id, failure.message.clone()).with_attempts(1),
        );
        format!(
            "{}\n{}\n{}\n{}\nexit 1",
            sleep,
            end,
            emit(&error),
            emit(&done)
        )
    }
}

impl Default for FakeWorkers {
    fn default() -> Self {
        Self::new()
    }
}

/// A shell line printing `msg` as one NDJSON frame.
fn emit(msg: &IpcMessage) -> String {
    let line = encode(msg).expect("Failed to encode message");
    format!("printf '%s\\n' '{}'", line.trim_end())
}

/// A config with fast backoff suitable for tests.
pub fn fast_config(concurrency: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        concurrency,
        shutdown_grace: Duration::from_millis(500),
        backoff_initial: Duration::from_millis(10),
        backoff_max: Duration::from_millis(40),
        ..Default::default()
    }
}

/// Orchestrator plus everything it needs, kept alive together.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: MemoryStoryStore,
    pub governor: ProcessGovernor,
    pub events: mpsc::Receiver<OrchestratorEvent>,
    _workspaces: TempDir,
}

impl Harness {
    pub fn new(
        config: OrchestratorConfig,
        workers: &FakeWorkers,
        stories: &[Story],
    ) -> Self {
        Self::with_store(config, workers, stories, MemoryStoryStore::new())
    }

    pub fn with_store(
        config: OrchestratorConfig,
        workers: &FakeWorkers,
        stories: &[Story],
        store: MemoryStoryStore,
    ) -> Self {
        let workspaces = TempDir::new().expect("Failed to create workspace root");
        let ids: Vec<&str> = stories.iter().map(|s| s.id.as_str()).collect();
        let governor = ProcessGovernor::new();
        let (tx, rx) = mpsc::channel(1024);
        let orchestrator = Orchestrator::new(
            config,
            governor.clone(),
            Arc::new(workers.spawner(&ids)),
            Arc::new(store.clone()),
            Arc::new(DirectoryProvisioner::new(workspaces.path())),
        )
        .with_events(tx);

        Self {
            orchestrator: Arc::new(orchestrator),
            store,
            governor,
            events: rx,
            _workspaces: workspaces,
        }
    }

    /// Every event emitted so far.
    pub fn drain_events(&mut self) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Create a test story with the given dependencies.
pub fn story(id: &str, deps: &[&str]) -> Story {
    Story::new(id, &format!("{} title", id)).with_dependencies(deps.iter().copied())
}

/// Find the result for `id`.
pub fn result_for<'a>(results: &'a [ExecutionResult], id: &str) -> &'a ExecutionResult {
    results
        .iter()
        .find(|r| r.story_id.as_str() == id)
        .unwrap_or_else(|| panic!("no result for {}", id))
}

/// A transient backend failure (HTTP 503).
pub fn transient() -> Failure {
    Failure::http(503, "service unavailable")
}

/// A permanent failure (HTTP 400).
pub fn permanent() -> Failure {
    Failure::http(400, "bad request")
}

/// Poll `cond` every 10ms until it holds or `within` elapses.
pub async fn wait_until(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Write `stories` as JSON files into `dir`, the layout `JsonStoryStore` reads.
pub fn write_story_files(dir: &Path, stories: &[Story]) {
    std::fs::create_dir_all(dir).expect("Failed to create store directory");
    for s in stories {
        let json = serde_json::to_string_pretty(s).expect("Failed to serialize story");
        std::fs::write(dir.join(format!("{}.json", s.id)), json)
            .expect("Failed to write story file");
    }
}
