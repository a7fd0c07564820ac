//! Runtime configuration model.
//!
//! Typed structs with compiled-in defaults. The loader merges YAML and
//! `VIBE_*` environment overrides on top and validates against the
//! sanity bounds declared here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Operation families with independent timeout budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    TaskExecution,
    TaskDecomposition,
    TaskRefinement,
    AgentCommunication,
    LlmRequest,
    FileOperations,
    DatabaseOperations,
    NetworkOperations,
}

impl TimeoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskExecution => "task_execution",
            Self::TaskDecomposition => "task_decomposition",
            Self::TaskRefinement => "task_refinement",
            Self::AgentCommunication => "agent_communication",
            Self::LlmRequest => "llm_request",
            Self::FileOperations => "file_operations",
            Self::DatabaseOperations => "database_operations",
            Self::NetworkOperations => "network_operations",
        }
    }
}

/// Per-operation timeout budgets in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub task_execution_secs: u64,
    pub task_decomposition_secs: u64,
    pub task_refinement_secs: u64,
    pub agent_communication_secs: u64,
    pub llm_request_secs: u64,
    pub file_operations_secs: u64,
    pub database_operations_secs: u64,
    pub network_operations_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            task_execution_secs: 300,
            task_decomposition_secs: 600,
            task_refinement_secs: 120,
            agent_communication_secs: 30,
            llm_request_secs: 60,
            file_operations_secs: 30,
            database_operations_secs: 10,
            network_operations_secs: 30,
        }
    }
}

impl Timeouts {
    pub fn for_kind(&self, kind: TimeoutKind) -> Duration {
        let secs = match kind {
            TimeoutKind::TaskExecution => self.task_execution_secs,
            TimeoutKind::TaskDecomposition => self.task_decomposition_secs,
            TimeoutKind::TaskRefinement => self.task_refinement_secs,
            TimeoutKind::AgentCommunication => self.agent_communication_secs,
            TimeoutKind::LlmRequest => self.llm_request_secs,
            TimeoutKind::FileOperations => self.file_operations_secs,
            TimeoutKind::DatabaseOperations => self.database_operations_secs,
            TimeoutKind::NetworkOperations => self.network_operations_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Backoff growth curve between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Fixed,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry policy applied by the TimeoutManager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry attempt `n` (1-indexed), capped at the max.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = match self.strategy {
            BackoffStrategy::Fixed => self.initial_delay_ms,
            BackoffStrategy::Exponential => {
                let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
                // Saturate rather than overflow on absurd exponents.
                let raw = (self.initial_delay_ms as f64) * factor;
                if raw.is_finite() && raw < u64::MAX as f64 {
                    raw as u64
                } else {
                    u64::MAX
                }
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// Scheduler selection algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerAlgorithm {
    PriorityFirst,
    EarliestDeadline,
    CriticalPath,
    ResourceBalanced,
    ShortestJob,
    HybridOptimal,
}

impl Default for SchedulerAlgorithm {
    fn default() -> Self {
        Self::HybridOptimal
    }
}

impl SchedulerAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PriorityFirst => "priority_first",
            Self::EarliestDeadline => "earliest_deadline",
            Self::CriticalPath => "critical_path",
            Self::ResourceBalanced => "resource_balanced",
            Self::ShortestJob => "shortest_job",
            Self::HybridOptimal => "hybrid_optimal",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "priority_first" => Some(Self::PriorityFirst),
            "earliest_deadline" => Some(Self::EarliestDeadline),
            "critical_path" => Some(Self::CriticalPath),
            "resource_balanced" => Some(Self::ResourceBalanced),
            "shortest_job" => Some(Self::ShortestJob),
            "hybrid_optimal" => Some(Self::HybridOptimal),
            _ => None,
        }
    }
}

/// Scoring weights for the hybrid_optimal algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridWeights {
    pub priority: f64,
    pub critical_path: f64,
    pub inverse_size: f64,
    pub wait_age: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            priority: 0.4,
            critical_path: 0.3,
            inverse_size: 0.2,
            wait_age: 0.1,
        }
    }
}

/// Scheduler policy fed to every planning pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerPolicy {
    pub algorithm: SchedulerAlgorithm,
    pub hybrid_weights: HybridWeights,
    /// Extra minutes granted beyond a task's estimate before the
    /// dispatcher times the run out.
    pub execution_slack_minutes: f64,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            algorithm: SchedulerAlgorithm::default(),
            hybrid_weights: HybridWeights::default(),
            execution_slack_minutes: 2.0,
        }
    }
}

/// Decomposition and concurrency caps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_concurrent_tasks: usize,
    pub max_depth: u32,
    pub max_tasks: usize,
    pub min_confidence: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            max_depth: 3,
            max_tasks: 100,
            min_confidence: 0.3,
        }
    }
}

/// Which layer drives atomicity verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NlpMethod {
    /// Deterministic rules first, oracle for the remainder (default)
    Hybrid,
    /// Deterministic rules only; passing specs are accepted atomic
    RulesOnly,
    /// Oracle verdicts only, hard invariants still enforced
    OracleOnly,
}

impl Default for NlpMethod {
    fn default() -> Self {
        Self::Hybrid
    }
}

impl NlpMethod {
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hybrid" => Some(Self::Hybrid),
            "rules_only" | "rules" => Some(Self::RulesOnly),
            "oracle_only" | "oracle" | "llm" => Some(Self::OracleOnly),
            _ => None,
        }
    }
}

/// Oracle endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub primary_nlp_method: NlpMethod,
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            primary_nlp_method: NlpMethod::default(),
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 4096,
            temperature: 0.3,
        }
    }
}

/// Progress bus tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub heartbeat_interval_secs: u64,
    /// Consecutive dropped events before a slow subscriber is cut off
    pub slow_drop_threshold: u32,
    /// Per-subscriber send buffer capacity
    pub buffer_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            slow_drop_threshold: 8,
            buffer_capacity: 64,
        }
    }
}

/// Dispatcher liveness settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub agent_liveness_timeout_secs: u64,
    pub liveness_sweep_interval_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            agent_liveness_timeout_secs: 90,
            liveness_sweep_interval_secs: 15,
        }
    }
}

/// One sliding-window limiter family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 120,
        }
    }
}

/// The four preconfigured limiter families.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitFamilies {
    pub general: RateLimitConfig,
    pub api: RateLimitConfig,
    pub upload: RateLimitConfig,
    pub task_start: RateLimitConfig,
}

impl Default for RateLimitFamilies {
    fn default() -> Self {
        Self {
            general: RateLimitConfig {
                window_ms: 60_000,
                max_requests: 300,
            },
            api: RateLimitConfig {
                window_ms: 60_000,
                max_requests: 120,
            },
            upload: RateLimitConfig {
                window_ms: 60_000,
                max_requests: 20,
            },
            task_start: RateLimitConfig {
                window_ms: 60_000,
                max_requests: 30,
            },
        }
    }
}

/// Supported transport kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Sse,
    Websocket,
    Stdio,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sse => "sse",
            Self::Websocket => "websocket",
            Self::Stdio => "stdio",
        }
    }
}

/// One transport listener binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportBinding {
    pub kind: TransportKind,
    #[serde(default = "default_host")]
    pub host: String,
    /// Preferred port; 0 lets the OS choose
    #[serde(default)]
    pub port: u16,
    /// How many successive ports to scan when the preferred one is taken
    #[serde(default = "default_port_scan_range")]
    pub port_scan_range: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port_scan_range() -> u16 {
    16
}

fn default_true() -> bool {
    true
}

/// Session persistence settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub root: String,
    /// Terminal-job retention; clamped to a 24 h floor by the loader
    pub retention_hours: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: ".vibeflow/sessions".to_string(),
            retention_hours: 24,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    /// Optional log directory for the daily-rotated daemon log
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            directory: None,
        }
    }
}

/// The full runtime configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    pub scheduler: SchedulerPolicy,
    pub limits: Limits,
    pub oracle: OracleConfig,
    pub bus: BusConfig,
    pub dispatcher: DispatcherConfig,
    pub rate_limits: RateLimitFamilies,
    pub transports: Vec<TransportBinding>,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// The transport set used when none is configured: both HTTP
    /// channels on adjacent preferred ports plus the stdio safety net.
    pub fn default_transports() -> Vec<TransportBinding> {
        vec![
            TransportBinding {
                kind: TransportKind::Sse,
                host: default_host(),
                port: 7890,
                port_scan_range: default_port_scan_range(),
                enabled: true,
            },
            TransportBinding {
                kind: TransportKind::Websocket,
                host: default_host(),
                port: 7891,
                port_scan_range: default_port_scan_range(),
                enabled: true,
            },
            TransportBinding {
                kind: TransportKind::Stdio,
                host: String::new(),
                port: 0,
                port_scan_range: 0,
                enabled: true,
            },
        ]
    }
}
