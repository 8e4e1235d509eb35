//! Orchestration layer for storyrun.
//!
//! This module provides the pieces that run stories in isolated worker
//! processes: the phase scheduler, the worker-side runtime, the IPC protocol
//! between them, process supervision, and failure recovery.

mod breaker;
mod classifier;
mod governor;
mod orchestrator;
mod pool;
mod protocol;
mod spawn;
mod worker;

pub use breaker::{RecoveryBreaker, DEFAULT_RECOVERY_CEILING};
pub use classifier::{
    backoff, classify, is_transient, should_retry, ErrorClass, Failure, TRANSIENT_CODES,
};
pub use governor::{
    install_shutdown_handlers, ProcessExit, ProcessGovernor, ShutdownReport, TrackedProcess,
};
pub use orchestrator::{DependencyPolicy, Orchestrator, OrchestratorConfig, OrchestratorEvent};
pub use pool::{WorkerPool, WorkerSlot};
pub use protocol::{
    decode, encode, ExecutionResult, IpcMessage, MessageBody, MessageReader, MessageWriter,
    Outcome,
};
pub use spawn::{CommandSpawner, WorkerSpawner};
pub use worker::{
    resolve_story_id, resolve_story_id_from_env, Worker, WorkerOptions, WorkerState,
    STORY_ID_ENV, WORKSPACE_ENV,
};
