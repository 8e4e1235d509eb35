//! Recovery circuit breaker.
//!
//! Bounds automatic recovery with a per-story counter that persists across
//! the story's whole lifetime. Phase-local retry limits cannot catch a story
//! that keeps bouncing between phases without progress; this counter does.

use crate::core::{Story, StoryId, StoryStatus};
use crate::store::StoryStore;
use crate::{slog, slog_warn, Result};

/// Default recovery ceiling.
pub const DEFAULT_RECOVERY_CEILING: u32 = 10;

/// Trips stories into `blocked` once their lifetime recovery count reaches
/// the ceiling.
///
/// # Example
///
/// ```
/// use storyrun::core::Story;
/// use storyrun::orchestration::RecoveryBreaker;
///
/// let breaker = RecoveryBreaker::new(2);
/// let mut story = Story::new("S-1", "demo");
/// assert!(!breaker.is_at_limit(&story));
/// story.total_recovery_attempts = 2;
/// assert!(breaker.is_at_limit(&story));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RecoveryBreaker {
    ceiling: u32,
}

impl Default for RecoveryBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_RECOVERY_CEILING)
    }
}

impl RecoveryBreaker {
    pub fn new(ceiling: u32) -> Self {
        Self { ceiling }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// True iff the story's counter has reached the ceiling.
    pub fn is_at_limit(&self, story: &Story) -> bool {
        story.total_recovery_attempts >= self.ceiling
    }

    /// Increment the story's recovery counter by one and persist it.
    ///
    /// Reloads the story first so the increment applies to the stored
    /// counter rather than a possibly stale copy.
    ///
    /// # Errors
    ///
    /// Propagates store failures, including `StoryNotFound`.
    pub async fn record_recovery_attempt(
        &self,
        store: &dyn StoryStore,
        id: &StoryId,
    ) -> Result<Story> {
        let mut story = store.load(id).await?;
        story.total_recovery_attempts = story.total_recovery_attempts.saturating_add(1);
        story.touch();
        store.save(&story).await?;
        slog!(
            "Recovery attempt recorded for {} ({}/{})",
            id,
            story.total_recovery_attempts,
            self.ceiling
        );
        Ok(story)
    }

    /// Human-readable reason embedding the counter and the ceiling.
    pub fn reason(&self, story: &Story) -> String {
        format!(
            "recovery limit reached ({}/{} automatic recovery attempts); unblock manually to resume",
            story.total_recovery_attempts, self.ceiling
        )
    }

    /// Move the story to `blocked` with the limit reason.
    pub async fn trip(&self, store: &dyn StoryStore, id: &StoryId) -> Result<Story> {
        let mut story = store.load(id).await?;
        let reason = self.reason(&story);
        slog_warn!("Circuit breaker tripped for {}: {}", id, reason);
        story.block(&reason);
        store.save(&story).await?;
        Ok(story)
    }

    /// Re-admit a blocked story, optionally zeroing its counter.
    ///
    /// The counter is only ever reset here, never automatically.
    pub async fn unblock(
        &self,
        store: &dyn StoryStore,
        id: &StoryId,
        reset_counter: bool,
    ) -> Result<Story> {
        let mut story = store.load(id).await?;
        story.set_status(StoryStatus::Ready);
        if reset_counter {
            story.total_recovery_attempts = 0;
        }
        store.save(&story).await?;
        slog!(
            "Unblocked {} (counter {})",
            id,
            if reset_counter { "reset" } else { "kept" }
        );
        Ok(story)
    }
}
