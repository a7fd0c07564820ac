//! Error taxonomy for the vibeflow runtime.
//!
//! Every error carries a stable kind string, a human-readable message,
//! and a retryability flag the TimeoutManager consults before scheduling
//! another attempt.

use thiserror::Error;
use uuid::Uuid;

/// Runtime errors shared across all orchestration components.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Invalid or missing configuration. Fatal during init, never retried.
    #[error("Invalid configuration for '{key}': expected {expected}, got {provided}")]
    Config {
        key: String,
        expected: String,
        provided: String,
    },

    /// Input failed schema or rule validation. Surfaced to the caller.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Operation exceeded its allotted time.
    #[error("Operation '{op}' timed out after {elapsed_ms}ms (limit {limit_ms}ms)")]
    Timeout {
        op: String,
        elapsed_ms: u64,
        limit_ms: u64,
    },

    /// Upstream model call failed or returned unparseable output.
    #[error("Oracle request failed: {0}")]
    Oracle(String),

    /// A dependency edge would introduce a cycle.
    #[error("Dependency edge would close a cycle at {closing_node}")]
    Cycle { closing_node: Uuid },

    /// Scheduler ready-set empty while unfinished work remains.
    #[error("Scheduling deadlock: {remaining} tasks remain with no runnable candidate")]
    Deadlock { remaining: usize },

    /// Illegal status transition attempted. Bug indicator.
    #[error("Invalid {entity} transition from {from} to {to}")]
    State {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Request denied by a rate limiter.
    #[error("Rate limit exceeded for '{key}', retry after {retry_after_secs}s")]
    RateLimit { key: String, retry_after_secs: u64 },

    /// Operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Entity lookup failed.
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// I/O failure in the persistence or transport layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure crossing a wire or persistence boundary.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Stable kind identifier included in events and persisted records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Validation(_) => "validation",
            Self::Timeout { .. } => "timeout",
            Self::Oracle(_) => "oracle",
            Self::Cycle { .. } => "cycle",
            Self::Deadlock { .. } => "deadlock",
            Self::State { .. } => "state",
            Self::RateLimit { .. } => "rate_limit",
            Self::Cancelled => "cancelled",
            Self::JobNotFound(_) => "not_found",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Whether another attempt may succeed without operator intervention.
    ///
    /// The TimeoutManager only re-runs operations whose failure is
    /// retryable; everything else short-circuits to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Oracle(_) | Self::RateLimit { .. } | Self::Io(_)
        )
    }
}
