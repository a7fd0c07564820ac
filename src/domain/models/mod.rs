//! Domain models for the vibeflow runtime.

pub mod config;
pub mod event;
pub mod graph;
pub mod job;
pub mod session;
pub mod task;
pub mod worker;

pub use config::{
    BackoffStrategy, BusConfig, Config, DispatcherConfig, HybridWeights, Limits, LoggingConfig,
    NlpMethod, OracleConfig, PersistenceConfig, RateLimitConfig, RateLimitFamilies, RetryPolicy,
    SchedulerAlgorithm, SchedulerPolicy, TimeoutKind, Timeouts, TransportBinding, TransportKind,
};
pub use event::{
    EventData, EventKind, HeartbeatData, JobProgress, ProgressEvent, SubscriptionFilter,
    TaskProgress,
};
pub use graph::{CriticalPath, DependencyGraph};
pub use job::{Job, JobError, JobStatus, JobTransition};
pub use session::{DecompositionSession, RichResults};
pub use task::{
    derive_task_id, has_coordinating_conjunction, AtomicTask, TaskPriority, TaskSpec,
    ATOMIC_MAX_FILE_PATHS, ATOMIC_MAX_MINUTES,
};
pub use worker::{Worker, WorkerStatus};
