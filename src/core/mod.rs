//! Core domain models for storyrun.
//!
//! This module contains the story data model and the dependency resolver
//! that partitions stories into barrier-synchronized phases.

pub mod dag;
pub mod story;

pub use dag::{group_stories_by_phase, validate_dependencies, DependencyIssue, Phase, StoryGraph};
pub use story::{Story, StoryId, StoryStatus};
