//! Worker slot accounting.
//!
//! The `WorkerPool` tracks which stories currently own a live worker
//! process. It enforces the concurrency ceiling and the rule that a story
//! never has more than one live process, which keeps the persisted recovery
//! counter single-writer.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::core::StoryId;
use crate::{Error, Result};

/// One occupied worker slot.
#[derive(Debug, Clone)]
pub struct WorkerSlot {
    pub story_id: StoryId,
    /// Worker pid, once the process is spawned.
    pub pid: Option<u32>,
    /// Dispatch number for this story in the current run, starting at 1.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

/// Tracks occupied worker slots.
///
/// # Example
///
/// ```
/// use storyrun::core::StoryId;
/// use storyrun::orchestration::WorkerPool;
///
/// let mut pool = WorkerPool::new(1);
/// pool.claim(StoryId::from("S-1"), 1).unwrap();
/// assert!(!pool.has_capacity());
/// pool.release(&StoryId::from("S-1"));
/// assert!(pool.has_capacity());
/// ```
#[derive(Debug, Default)]
pub struct WorkerPool {
    slots: HashMap<StoryId, WorkerSlot>,
    max_concurrent: usize,
}

impl WorkerPool {
    /// A pool of `max_concurrent` slots. Zero is allowed: nothing will ever
    /// be admitted.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            slots: HashMap::new(),
            max_concurrent,
        }
    }

    /// Occupy a slot for `story_id`.
    ///
    /// # Errors
    ///
    /// - `StoryAlreadyActive` if the story already holds a slot
    /// - `WorkerPoolFull` if every slot is taken
    pub fn claim(&mut self, story_id: StoryId, attempt: u32) -> Result<&WorkerSlot> {
        if self.slots.contains_key(&story_id) {
            return Err(Error::StoryAlreadyActive(story_id));
        }
        if !self.has_capacity() {
            return Err(Error::WorkerPoolFull {
                max: self.max_concurrent,
            });
        }
        let slot = WorkerSlot {
            story_id: story_id.clone(),
            pid: None,
            attempt,
            started_at: Utc::now(),
        };
        Ok(self.slots.entry(story_id).or_insert(slot))
    }

    /// Record the pid of the worker occupying `story_id`'s slot.
    pub fn set_pid(&mut self, story_id: &StoryId, pid: u32) {
        if let Some(slot) = self.slots.get_mut(story_id) {
            slot.pid = Some(pid);
        }
    }

    /// Free the slot held by `story_id`, if any.
    pub fn release(&mut self, story_id: &StoryId) -> Option<WorkerSlot> {
        self.slots.remove(story_id)
    }

    pub fn get(&self, story_id: &StoryId) -> Option<&WorkerSlot> {
        self.slots.get(story_id)
    }

    pub fn is_active(&self, story_id: &StoryId) -> bool {
        self.slots.contains_key(story_id)
    }

    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_concurrent
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn slots(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.values()
    }
}
