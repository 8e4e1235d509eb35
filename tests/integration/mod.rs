//! Integration test suite for storyrun.
//!
//! These tests run real worker processes through the orchestrator and the
//! `storyrun` binary. They verify that scheduling, recovery, shutdown and
//! the worker protocol work together correctly.
//!
//! # Test Categories
//!
//! - `scheduling`: Phase barriers, concurrency ceiling, dependency policy
//! - `recovery`: Retries, the recovery circuit breaker, process faults
//! - `shutdown`: Graceful and forced shutdown, health checks
//! - `cli`: The binary's worker and orchestrator entry points
//!
//! # CI Compatibility
//!
//! Workers are `/bin/sh` scripts or the binary itself with `true`/`false`
//! standing in for the coding agent, so no network access is needed.

mod fixtures;

mod cli;
mod recovery;
mod scheduling;
