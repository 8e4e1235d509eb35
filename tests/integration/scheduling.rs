//! Phase scheduling integration tests.
//!
//! These tests run real worker processes (fake `/bin/sh` workers) through
//! the orchestrator and verify barrier ordering, the concurrency ceiling,
//! and the handling of failed dependencies.

use std::time::Duration;

use storyrun::orchestration::{DependencyPolicy, OrchestratorEvent, Outcome};

use crate::fixtures::{fast_config, permanent, result_for, story, Behavior, FakeWorkers, Harness};

/// Test: Diamond dependencies respect phase barriers
/// Given A; B and C depending on A; D depending on B and C
/// When the stories are executed with concurrency 3
/// Then B and C start after A ends, and D starts after both end
#[tokio::test]
async fn test_diamond_respects_phase_barriers() {
    let workers = FakeWorkers::new();
    let stories = vec![
        story("A", &[]),
        story("B", &["A"]),
        story("C", &["A"]),
        story("D", &["B", "C"]),
    ];
    let mut harness = Harness::new(fast_config(3), &workers, &stories);

    let results = harness.orchestrator.execute(&stories).await.unwrap();

    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.success), "{:?}", results);

    let pos = |line: &str| workers.position(line).unwrap_or_else(|| panic!("missing {}", line));
    assert!(pos("end A") < pos("start B"));
    assert!(pos("end A") < pos("start C"));
    assert!(pos("end B") < pos("start D"));
    assert!(pos("end C") < pos("start D"));

    let phases: Vec<usize> = harness
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            OrchestratorEvent::PhaseStarted { index, .. } => Some(index),
            _ => None,
        })
        .collect();
    assert_eq!(phases, vec![0, 1, 2]);
}

/// Test: Concurrency ceiling is never exceeded
/// Given five independent stories and concurrency 2
/// When they are executed
/// Then at most two workers are ever alive and all five succeed
#[tokio::test]
async fn test_concurrency_ceiling() {
    let workers = FakeWorkers::new().with_work_time(Duration::from_millis(150));
    let stories: Vec<_> = (1..=5).map(|i| story(&format!("S-{}", i), &[])).collect();
    let harness = Harness::new(fast_config(2), &workers, &stories);

    let results = harness.orchestrator.execute(&stories).await.unwrap();

    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.success));
    assert!(workers.peak_concurrency() <= 2, "log: {:?}", workers.log());
    assert_eq!(harness.orchestrator.active_count(), 0);
    assert_eq!(harness.governor.active_count(), 0);
}

/// Test: Dependents of a failed story are skipped by default
/// Given A failing permanently and B depending on A
/// When executed with the default policy
/// Then A is failed, B is skipped naming A, and B never starts
#[tokio::test]
async fn test_failed_dependency_skips_dependents() {
    let workers = FakeWorkers::new().with("A", Behavior::Fail(permanent()));
    let stories = vec![story("A", &[]), story("B", &["A"]), story("C", &[])];
    let harness = Harness::new(fast_config(2), &workers, &stories);

    let results = harness.orchestrator.execute(&stories).await.unwrap();

    assert_eq!(result_for(&results, "A").outcome, Outcome::Failed);
    assert_eq!(result_for(&results, "C").outcome, Outcome::Succeeded);
    let b = result_for(&results, "B");
    assert_eq!(b.outcome, Outcome::Skipped);
    assert!(!b.success);
    assert!(b.error.as_deref().unwrap_or("").contains('A'));
    assert_eq!(workers.starts("B"), 0);
}

/// Test: Proceed policy dispatches dependents anyway
/// Given A failing permanently and B depending on A
/// When executed with DependencyPolicy::Proceed
/// Then B still runs after A's phase completes
#[tokio::test]
async fn test_proceed_policy_runs_dependents() {
    let workers = FakeWorkers::new().with("A", Behavior::Fail(permanent()));
    let stories = vec![story("A", &[]), story("B", &["A"])];
    let mut config = fast_config(2);
    config.dependency_policy = DependencyPolicy::Proceed;
    let harness = Harness::new(config, &workers, &stories);

    let results = harness.orchestrator.execute(&stories).await.unwrap();

    assert_eq!(result_for(&results, "A").outcome, Outcome::Failed);
    assert_eq!(result_for(&results, "B").outcome, Outcome::Succeeded);
    assert!(workers.position("end A").unwrap() < workers.position("start B").unwrap());
}

/// Test: Events describe the run
/// Given a single story
/// When it is executed
/// Then started, progress, completed and summary events are emitted in order
#[tokio::test]
async fn test_events_for_single_story() {
    let workers = FakeWorkers::new();
    let stories = vec![story("solo", &[])];
    let mut harness = Harness::new(fast_config(1), &workers, &stories);

    harness.orchestrator.execute(&stories).await.unwrap();
    let events = harness.drain_events();

    let kind = |e: &OrchestratorEvent| match e {
        OrchestratorEvent::PhaseStarted { .. } => "phase_started",
        OrchestratorEvent::StoryStarted { .. } => "story_started",
        OrchestratorEvent::StoryProgress { .. } => "story_progress",
        OrchestratorEvent::StoryCompleted { .. } => "story_completed",
        OrchestratorEvent::PhaseCompleted { .. } => "phase_completed",
        OrchestratorEvent::AllPhasesComplete { .. } => "all_complete",
        _ => "other",
    };
    let kinds: Vec<&str> = events.iter().map(kind).collect();
    assert_eq!(
        kinds,
        vec![
            "phase_started",
            "story_started",
            "story_progress",
            "story_completed",
            "phase_completed",
            "all_complete"
        ]
    );

    match &events[2] {
        OrchestratorEvent::StoryProgress { progress, message, .. } => {
            assert_eq!(*progress, Some(50));
            assert_eq!(message.as_deref(), Some("halfway"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

/// Test: Results accumulate across runs
/// Given two sequential executions
/// When results() is queried
/// Then it holds the results of both
#[tokio::test]
async fn test_results_accumulate() {
    let workers = FakeWorkers::new();
    let first = vec![story("one", &[])];
    let second = vec![story("two", &[])];
    let all: Vec<_> = first.iter().chain(second.iter()).cloned().collect();
    let harness = Harness::new(fast_config(1), &workers, &all);

    harness.orchestrator.execute(&first).await.unwrap();
    harness.orchestrator.execute(&second).await.unwrap();

    let ids: Vec<String> = harness
        .orchestrator
        .results()
        .iter()
        .map(|r| r.story_id.to_string())
        .collect();
    assert_eq!(ids, vec!["one", "two"]);
}
