//! End-to-end tests of the `storyrun` binary.
//!
//! The worker sub-command is driven over real pipes, and `storyrun run`
//! re-invokes the binary as its own workers. The coding agent is replaced
//! by `true`/`false` through the config file.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use storyrun::core::{Story, StoryStatus};
use storyrun::orchestration::{decode, ExecutionResult, MessageBody, Outcome};

use crate::fixtures::{story, write_story_files};

/// An isolated storyrun home with a config and a story store.
struct Env {
    home: TempDir,
}

impl Env {
    fn new(agent_command: &str, stories: &[Story]) -> Self {
        let home = TempDir::new().expect("Failed to create home");
        let config = format!(
            "workspace_dir = \"{}\"\n\n[orchestrator]\nconcurrency = 2\nbackoff_initial_ms = 10\nbackoff_max_ms = 20\n\n[worker]\nagent_command = \"{}\"\nmax_retries = 0\n",
            home.path().join("workspaces").display(),
            agent_command
        );
        std::fs::write(home.path().join("storyrun.toml"), config).expect("Failed to write config");
        write_story_files(&home.path().join("stories"), stories);
        Self { home }
    }

    fn store_dir(&self) -> PathBuf {
        self.home.path().join("stories")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_storyrun"));
        cmd.env("STORYRUN_HOME", self.home.path())
            .env("STORYRUN_STORE_DIR", self.store_dir())
            .env_remove("STORYRUN_STORY_ID")
            .env_remove("STORYRUN_WORKSPACE");
        cmd
    }

    fn stored(&self, id: &str) -> Story {
        read_story(&self.store_dir(), id)
    }
}

fn read_story(dir: &Path, id: &str) -> Story {
    let json = std::fs::read_to_string(dir.join(format!("{}.json", id))).expect("Missing story file");
    serde_json::from_str(&json).expect("Invalid story file")
}

/// Run `storyrun worker <id>`, keeping stdin open until `complete` arrives.
fn run_worker(env: &Env, id: &str) -> (Vec<MessageBody>, i32) {
    let workspace = env.home.path().join("ws");
    std::fs::create_dir_all(&workspace).unwrap();
    let mut child = env
        .command()
        .args(["worker", id, "--workspace"])
        .arg(&workspace)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    let stdin = child.stdin.take().unwrap();
    let stdout = BufReader::new(child.stdout.take().unwrap());
    let mut bodies = Vec::new();
    for line in stdout.lines() {
        let line = line.unwrap();
        if line.trim().is_empty() {
            continue;
        }
        let msg = decode(&line).unwrap();
        assert_eq!(msg.story_id.as_str(), id);
        let done = matches!(msg.body, MessageBody::Complete { .. });
        bodies.push(msg.body);
        if done {
            break;
        }
    }
    drop(stdin);
    let status = child.wait().unwrap();
    (bodies, status.code().unwrap_or(-1))
}

/// Test: Worker without a story id
/// Given no positional id and no STORYRUN_STORY_ID
/// When `storyrun worker` starts
/// Then it exits 1 naming the environment variable
#[test]
fn test_worker_requires_story_id() {
    let env = Env::new("true", &[]);
    let output = env.command().arg("worker").output().unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("STORYRUN_STORY_ID"), "stderr: {}", stderr);
}

/// Test: Worker success path
/// Given a stored story and an agent that succeeds
/// When `storyrun worker` runs it
/// Then it sends complete(success), exits 0, and the story is done
#[test]
fn test_worker_completes_story() {
    let env = Env::new("true", &[story("S-1", &[])]);
    let (bodies, code) = run_worker(&env, "S-1");

    assert_eq!(code, 0);
    match bodies.last() {
        Some(MessageBody::Complete { result }) => {
            assert!(result.success);
            assert_eq!(result.outcome, Outcome::Succeeded);
        }
        other => panic!("expected complete, got {:?}", other),
    }
    assert_eq!(env.stored("S-1").status, StoryStatus::Done);
}

/// Test: Worker failure path
/// Given an agent that exits non-zero
/// When `storyrun worker` runs the story
/// Then it reports an error, completes unsuccessfully, exits 1, and resets the story
#[test]
fn test_worker_reports_failure() {
    let env = Env::new("false", &[story("S-2", &[])]);
    let (bodies, code) = run_worker(&env, "S-2");

    assert_eq!(code, 1);
    assert!(bodies
        .iter()
        .any(|b| matches!(b, MessageBody::Error { failure: Some(_), .. })));
    match bodies.last() {
        Some(MessageBody::Complete { result }) => assert!(!result.success),
        other => panic!("expected complete, got {:?}", other),
    }
    assert_eq!(env.stored("S-2").status, StoryStatus::Ready);
}

/// Test: Worker exits while its input is still open
/// Given an orchestrator that keeps the worker's stdin open after complete
/// When the story finishes
/// Then the worker process exits 0 on its own
#[test]
fn test_worker_exits_with_stdin_open() {
    let env = Env::new("true", &[story("S-3", &[])]);
    let workspace = env.home.path().join("ws");
    std::fs::create_dir_all(&workspace).unwrap();
    let mut child = env
        .command()
        .args(["worker", "S-3", "--workspace"])
        .arg(&workspace)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    let _stdin = child.stdin.take().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break Some(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    let status = status.expect("worker did not exit after completing");
    assert_eq!(status.code(), Some(0));
    assert_eq!(env.stored("S-3").status, StoryStatus::Done);
}

/// Test: Full run through the binary
/// Given A and B depending on A in the store
/// When `storyrun run B` executes
/// Then both run in worker processes, results print as JSON, and both are done
#[test]
fn test_run_end_to_end() {
    let env = Env::new("true", &[story("A", &[]), story("B", &["A"]), story("X", &[])]);
    let output = env.command().args(["run", "B"]).output().unwrap();

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let results: Vec<ExecutionResult> = serde_json::from_slice(&output.stdout).unwrap();
    let ids: Vec<&str> = results.iter().map(|r| r.story_id.as_str()).collect();
    assert_eq!(ids, vec!["A", "B"]);
    assert!(results.iter().all(|r| r.success));

    assert_eq!(env.stored("A").status, StoryStatus::Done);
    assert_eq!(env.stored("B").status, StoryStatus::Done);
    // X was not requested.
    assert_eq!(env.stored("X").status, StoryStatus::Ready);
}

/// Test: Failed run exits non-zero
/// Given an agent that always fails
/// When `storyrun run` executes
/// Then the process exits 1 and the results show the failure
#[test]
fn test_run_failure_exit_code() {
    let env = Env::new("false", &[story("A", &[])]);
    let output = env.command().arg("run").output().unwrap();

    assert_eq!(output.status.code(), Some(1));
    let results: Vec<ExecutionResult> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, Outcome::Failed);
    assert_eq!(results[0].exit_code, Some(1));
}

/// Test: Missing agent fails the run up front
/// Given an agent command whose binary is not installed
/// When `storyrun run` executes
/// Then it fails naming the binary and no story is touched
#[test]
fn test_run_without_agent_fails_fast() {
    let env = Env::new("/no/such/agent-binary -p", &[story("A", &[])]);
    let output = env.command().arg("run").output().unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("/no/such/agent-binary"), "stderr: {}", stderr);
    assert!(output.stdout.is_empty());
    assert_eq!(env.stored("A").status, StoryStatus::Ready);
}

/// Test: Validation catches cycles
/// Given stories A and B depending on each other
/// When `storyrun validate` runs
/// Then it fails without spawning anything
#[test]
fn test_validate_rejects_cycle() {
    let env = Env::new("true", &[story("A", &["B"]), story("B", &["A"])]);
    let output = env.command().arg("validate").output().unwrap();
    assert!(!output.status.success());

    let ok = Env::new("true", &[story("A", &[]), story("B", &["A"])]);
    let output = ok.command().arg("validate").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("2 phase(s)"), "stdout: {}", stdout);
}

/// Test: Unblock resets a blocked story
/// Given a story blocked at its recovery limit
/// When `storyrun unblock --reset` runs
/// Then it is ready again with a zero counter
#[test]
fn test_unblock_command() {
    let mut blocked = story("B-1", &[]);
    blocked.total_recovery_attempts = 10;
    blocked.block("recovery limit reached (10/10 automatic recovery attempts)");
    let env = Env::new("true", &[blocked]);

    let output = env.command().args(["unblock", "B-1", "--reset"]).output().unwrap();
    assert!(output.status.success());

    let stored = env.stored("B-1");
    assert_eq!(stored.status, StoryStatus::Ready);
    assert_eq!(stored.total_recovery_attempts, 0);
    assert!(stored.blocked_reason.is_none());

    let status = env.command().arg("status").output().unwrap();
    assert!(String::from_utf8_lossy(&status.stdout).contains("B-1"));
}
