//! Failure recovery integration tests.
//!
//! These tests verify that transient failures are retried with the
//! lifetime recovery counter persisted, that permanent failures are not,
//! and that the circuit breaker blocks a story at its ceiling.

use storyrun::core::{StoryId, StoryStatus};
use storyrun::orchestration::{OrchestratorEvent, Outcome, RecoveryBreaker};
use storyrun::store::{MemoryStoryStore, StoryStore};

use crate::fixtures::{
    fast_config, permanent, result_for, story, transient, Behavior, FakeWorkers, Harness,
};

/// Test: Transient failures are retried until success
/// Given a story failing with HTTP 503 twice
/// When executed
/// Then it succeeds on the third dispatch with two recovery attempts recorded
#[tokio::test]
async fn test_transient_failure_retried() {
    let workers = FakeWorkers::new().with("flaky", Behavior::FailTimes(2, transient()));
    let stories = vec![story("flaky", &[])];
    let mut harness = Harness::new(fast_config(1), &workers, &stories);

    let results = harness.orchestrator.execute(&stories).await.unwrap();

    let flaky = result_for(&results, "flaky");
    assert_eq!(flaky.outcome, Outcome::Succeeded);
    assert_eq!(flaky.attempts, 3);
    assert_eq!(workers.starts("flaky"), 3);

    let stored = harness.store.load(&StoryId::from("flaky")).await.unwrap();
    assert_eq!(stored.total_recovery_attempts, 2);

    let retries: Vec<u32> = harness
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            OrchestratorEvent::RetryScheduled {
                recovery_attempt, ..
            } => Some(recovery_attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2]);
}

/// Test: Permanent failures are not retried
/// Given a story failing with HTTP 400
/// When executed
/// Then it is dispatched once and the recovery counter stays at zero
#[tokio::test]
async fn test_permanent_failure_not_retried() {
    let workers = FakeWorkers::new().with("bad", Behavior::Fail(permanent()));
    let stories = vec![story("bad", &[])];
    let harness = Harness::new(fast_config(1), &workers, &stories);

    let results = harness.orchestrator.execute(&stories).await.unwrap();

    let bad = result_for(&results, "bad");
    assert_eq!(bad.outcome, Outcome::Failed);
    assert_eq!(bad.exit_code, Some(1));
    assert!(bad.error.as_deref().unwrap().contains("bad request"));
    assert_eq!(workers.starts("bad"), 1);

    let stored = harness.store.load(&StoryId::from("bad")).await.unwrap();
    assert_eq!(stored.total_recovery_attempts, 0);
}

/// Test: Circuit breaker blocks a story at its ceiling
/// Given a story that always fails transiently and a ceiling of 2
/// When executed
/// Then it is dispatched three times, then blocked with reason "2/2"
#[tokio::test]
async fn test_breaker_blocks_at_ceiling() {
    let workers = FakeWorkers::new().with("loop", Behavior::Fail(transient()));
    let stories = vec![story("loop", &[]), story("after", &["loop"])];
    let mut config = fast_config(1);
    config.recovery_ceiling = 2;
    let harness = Harness::new(config, &workers, &stories);

    let results = harness.orchestrator.execute(&stories).await.unwrap();

    let looped = result_for(&results, "loop");
    assert_eq!(looped.outcome, Outcome::Blocked);
    assert!(looped.error.as_deref().unwrap().contains("2/2"), "{:?}", looped.error);
    assert_eq!(workers.starts("loop"), 3);
    assert_eq!(result_for(&results, "after").outcome, Outcome::Skipped);

    let stored = harness.store.load(&StoryId::from("loop")).await.unwrap();
    assert_eq!(stored.status, StoryStatus::Blocked);
    assert_eq!(stored.total_recovery_attempts, 2);
    assert!(stored.blocked_reason.is_some());
}

/// Test: The recovery counter is lifetime, not per run
/// Given a story already carrying 2 of 2 recovery attempts
/// When it fails transiently once
/// Then it is blocked immediately without a retry
#[tokio::test]
async fn test_counter_survives_runs() {
    let mut seeded = story("veteran", &[]);
    seeded.total_recovery_attempts = 2;
    let store = MemoryStoryStore::with_stories([seeded.clone()]);
    let workers = FakeWorkers::new().with("veteran", Behavior::Fail(transient()));
    let mut config = fast_config(1);
    config.recovery_ceiling = 2;
    let harness = Harness::with_store(config, &workers, &[seeded.clone()], store);

    let results = harness.orchestrator.execute(&[seeded]).await.unwrap();

    assert_eq!(result_for(&results, "veteran").outcome, Outcome::Blocked);
    assert_eq!(workers.starts("veteran"), 1);
}

/// Test: Unblocking re-admits a story
/// Given a story blocked by the breaker
/// When it is unblocked with a counter reset and run again
/// Then it is dispatched again
#[tokio::test]
async fn test_unblock_readmits_story() {
    let workers = FakeWorkers::new().with("s", Behavior::FailTimes(2, transient()));
    let stories = vec![story("s", &[])];
    let mut config = fast_config(1);
    config.recovery_ceiling = 1;
    let harness = Harness::new(config, &workers, &stories);

    let first = harness.orchestrator.execute(&stories).await.unwrap();
    assert_eq!(result_for(&first, "s").outcome, Outcome::Blocked);

    // Blocked stories are not dispatched.
    let again = harness.orchestrator.execute(&stories).await.unwrap();
    assert_eq!(result_for(&again, "s").outcome, Outcome::Blocked);
    assert_eq!(workers.starts("s"), 2);

    RecoveryBreaker::new(1)
        .unblock(&harness.store, &StoryId::from("s"), true)
        .await
        .unwrap();
    let last = harness.orchestrator.execute(&stories).await.unwrap();
    assert_eq!(result_for(&last, "s").outcome, Outcome::Succeeded);
    assert_eq!(workers.starts("s"), 3);
}

/// Test: A worker that dies without reporting is a process fault
/// Given a story left in-progress by an earlier crash, and a worker that exits 3
/// When executed
/// Then the result is failed with the exit code and the story is reset to ready
#[tokio::test]
async fn test_crash_without_complete_is_fault() {
    let stale = story("crashy", &[]).with_status(StoryStatus::InProgress);
    let store = MemoryStoryStore::with_stories([stale.clone()]);
    let workers = FakeWorkers::new().with("crashy", Behavior::Crash(3));
    let harness = Harness::with_store(fast_config(1), &workers, &[stale.clone()], store);

    let results = harness.orchestrator.execute(&[stale]).await.unwrap();

    let crashy = result_for(&results, "crashy");
    assert_eq!(crashy.outcome, Outcome::Failed);
    assert_eq!(crashy.exit_code, Some(3));
    assert!(crashy.error.as_deref().unwrap().contains("without completing"));
    assert_eq!(workers.starts("crashy"), 1);

    let stored = harness.store.load(&StoryId::from("crashy")).await.unwrap();
    assert_eq!(stored.status, StoryStatus::Ready);
}
