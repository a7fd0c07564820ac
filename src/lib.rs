//! Vibeflow - task-orchestration runtime
//!
//! Accepts high-level work items, decomposes them recursively into
//! atomic subtasks with a deterministic rule layer plus a language
//! oracle, schedules the atomics against a worker pool under dependency
//! constraints, and streams progress to subscribers over SSE,
//! websocket, and stdio transports.

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use domain::errors::{OrchestratorError, OrchestratorResult};
pub use domain::models::{DecompositionSession, DependencyGraph, Job, JobStatus, TaskSpec};
