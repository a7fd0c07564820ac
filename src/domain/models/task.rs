//! Task domain models.
//!
//! A `TaskSpec` is the high-level unit of work submitted to the runtime.
//! Decomposition reduces specs to `AtomicTask`s, the only things the
//! scheduler will ever place on a worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};

/// Maximum duration (minutes) an atomic task may claim.
pub const ATOMIC_MAX_MINUTES: f64 = 20.0;

/// Maximum number of file paths an atomic task may touch.
pub const ATOMIC_MAX_FILE_PATHS: usize = 2;

/// Priority level for tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "normal" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Numeric weight used by scoring schedulers.
    pub fn weight(&self) -> f64 {
        f64::from(*self as u8 as u32)
    }
}

/// A high-level unit of work submitted for decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique identifier
    pub id: Uuid,
    /// Human-readable title
    pub title: String,
    /// Detailed description
    pub description: String,
    /// Priority
    #[serde(default)]
    pub priority: TaskPriority,
    /// Semantic type tag (used for worker capability matching)
    #[serde(default)]
    pub task_type: String,
    /// Estimated effort in minutes (>= 0)
    #[serde(default)]
    pub estimated_minutes: f64,
    /// Declared dependency ids
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    /// Acceptance criteria
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// File paths the task is expected to touch
    #[serde(default)]
    pub file_paths: Vec<String>,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Owning project id
    #[serde(default)]
    pub project_id: Option<Uuid>,
    /// Optional deadline for SLA-driven scheduling
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// When the spec was created
    pub created_at: DateTime<Utc>,
}

impl TaskSpec {
    /// Create a new spec with a random id.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            priority: TaskPriority::default(),
            task_type: "standard".to_string(),
            estimated_minutes: 0.0,
            depends_on: Vec::new(),
            acceptance_criteria: Vec::new(),
            file_paths: Vec::new(),
            tags: Vec::new(),
            project_id: None,
            deadline: None,
            created_at: Utc::now(),
        }
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the semantic type tag.
    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    /// Set the effort estimate in minutes.
    pub fn with_estimate(mut self, minutes: f64) -> Self {
        self.estimated_minutes = minutes;
        self
    }

    /// Add a dependency, ignoring duplicates and self-references.
    pub fn with_dependency(mut self, task_id: Uuid) -> Self {
        if !self.depends_on.contains(&task_id) && task_id != self.id {
            self.depends_on.push(task_id);
        }
        self
    }

    /// Add an acceptance criterion.
    pub fn with_criterion(mut self, criterion: impl Into<String>) -> Self {
        self.acceptance_criteria.push(criterion.into());
        self
    }

    /// Add a file path.
    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_paths.push(path.into());
        self
    }

    /// Set the owning project.
    pub fn with_project(mut self, project_id: Uuid) -> Self {
        self.project_id = Some(project_id);
        self
    }

    /// Set a deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Basic input validation for submitted specs.
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.title.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "task title cannot be empty".into(),
            ));
        }
        if self.description.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "task description cannot be empty".into(),
            ));
        }
        if self.estimated_minutes < 0.0 || !self.estimated_minutes.is_finite() {
            return Err(OrchestratorError::Validation(format!(
                "estimated_minutes must be a finite value >= 0, got {}",
                self.estimated_minutes
            )));
        }
        if self.depends_on.contains(&self.id) {
            return Err(OrchestratorError::Validation(
                "task cannot depend on itself".into(),
            ));
        }
        Ok(())
    }
}

/// A task the detector has certified as indivisible.
///
/// The constructor is the only way to obtain one; a spec that fails any
/// atomicity bound cannot occupy an `AtomicTask` slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicTask {
    #[serde(flatten)]
    pub spec: TaskSpec,
    /// Detector confidence in the atomic verdict, clamped to [0, 1]
    pub atomicity_confidence: f64,
    /// Set when the task was forced atomic by a depth or fan-out cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap_warning: Option<String>,
}

impl AtomicTask {
    /// Certify a spec as atomic, enforcing every atomicity bound.
    pub fn certify(spec: TaskSpec, confidence: f64) -> OrchestratorResult<Self> {
        spec.validate()?;
        if spec.estimated_minutes > ATOMIC_MAX_MINUTES {
            return Err(OrchestratorError::Validation(format!(
                "atomic task '{}' exceeds duration threshold: {} > {} minutes",
                spec.title, spec.estimated_minutes, ATOMIC_MAX_MINUTES
            )));
        }
        if spec.file_paths.len() > ATOMIC_MAX_FILE_PATHS {
            return Err(OrchestratorError::Validation(format!(
                "atomic task '{}' is a multi-file change: {} paths",
                spec.title,
                spec.file_paths.len()
            )));
        }
        if spec.acceptance_criteria.len() != 1 {
            return Err(OrchestratorError::Validation(format!(
                "atomic task '{}' must have exactly one acceptance criterion, has {}",
                spec.title,
                spec.acceptance_criteria.len()
            )));
        }
        if has_coordinating_conjunction(&spec.title) {
            return Err(OrchestratorError::Validation(format!(
                "atomic task title '{}' joins multiple actions",
                spec.title
            )));
        }
        Ok(Self {
            spec,
            atomicity_confidence: confidence.clamp(0.0, 1.0),
            cap_warning: None,
        })
    }

    /// Certify a spec atomic because a decomposition cap was reached.
    ///
    /// The atomicity bounds are still enforced for paths and criteria;
    /// the warning travels with the task so downstream consumers can see
    /// it never passed the detector.
    pub fn certify_by_cap(mut spec: TaskSpec, warning: impl Into<String>) -> Self {
        if spec.acceptance_criteria.len() != 1 {
            let criterion = spec
                .acceptance_criteria
                .first()
                .cloned()
                .unwrap_or_else(|| format!("{} is done", spec.title));
            spec.acceptance_criteria = vec![criterion];
        }
        spec.file_paths.truncate(ATOMIC_MAX_FILE_PATHS);
        if spec.estimated_minutes > ATOMIC_MAX_MINUTES {
            spec.estimated_minutes = ATOMIC_MAX_MINUTES;
        }
        Self {
            spec,
            atomicity_confidence: 0.0,
            cap_warning: Some(warning.into()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.spec.id
    }

    /// Scheduling weight: the effort estimate, or 1.0 when absent so
    /// critical-path lengths stay comparable across unestimated tasks.
    pub fn weight(&self) -> f64 {
        if self.spec.estimated_minutes > 0.0 {
            self.spec.estimated_minutes
        } else {
            1.0
        }
    }
}

/// Derive a deterministic task id from a session id and a counter.
///
/// Replays of a decomposition session with identical oracle responses
/// must produce byte-identical output, so ids come from a v5 UUID over
/// the session namespace rather than wall-clock entropy.
pub fn derive_task_id(session_id: Uuid, counter: u64) -> Uuid {
    Uuid::new_v5(&session_id, &counter.to_be_bytes())
}

/// Whether the text contains a standalone coordinating conjunction
/// ("and"/"or") joining two phrases.
///
/// A coordinator at either end of the text joins nothing and does not
/// count; neither do substrings inside larger words ("android", "order").
pub fn has_coordinating_conjunction(text: &str) -> bool {
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    words.iter().enumerate().any(|(i, w)| {
        let lower = w.to_lowercase();
        (lower == "and" || lower == "or") && i > 0 && i + 1 < words.len()
    })
}
