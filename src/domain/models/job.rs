//! Job domain model.
//!
//! A job is the externally visible lifecycle wrapper around one
//! decomposition-and-execution run. Its status machine is enforced here;
//! the JobStore never mutates a job except through these transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::config::RetryPolicy;

/// Status of a job in the orchestration pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet picked up
    Pending,
    /// Actively decomposing or executing
    Running,
    /// Dispatch gate closed; running tasks continue
    Paused,
    /// All work finished successfully
    Completed,
    /// Unrecovered error reached the dispatcher
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [JobStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Cancelled],
            Self::Running => &[Self::Paused, Self::Completed, Self::Failed, Self::Cancelled],
            Self::Paused => &[Self::Running, Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Error details attached to a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    /// Stable error kind (see the error taxonomy)
    pub kind: String,
    /// Human-readable message
    pub message: String,
}

/// One entry in the append-only transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTransition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The externally visible lifecycle record for one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier
    pub id: Uuid,
    /// Current status
    pub status: JobStatus,
    /// Progress percentage; 100 exactly when completed
    pub progress: u8,
    /// Latest progress message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Result payload, set on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error details, set on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Parent job for sub-jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestor_job_id: Option<Uuid>,
    /// Owning project id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    /// Retry count across dispatch attempts
    pub retry_count: u32,
    /// Retry policy snapshot taken at creation
    pub policy: RetryPolicy,
    /// Append-only transition log
    #[serde(default)]
    pub transitions: Vec<JobTransition>,
    /// When created
    pub created_at: DateTime<Utc>,
    /// When last updated
    pub updated_at: DateTime<Utc>,
    /// When execution started
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal status was reached
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job with a policy snapshot.
    pub fn new(policy: RetryPolicy) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            progress: 0,
            message: None,
            result: None,
            error: None,
            ancestor_job_id: None,
            project_id: None,
            retry_count: 0,
            policy,
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Mark this job as a sub-job of another.
    pub fn with_ancestor(mut self, ancestor: Uuid) -> Self {
        self.ancestor_job_id = Some(ancestor);
        self
    }

    /// Set the owning project.
    pub fn with_project(mut self, project_id: Uuid) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition to a new status, recording the step in the log.
    pub fn transition_to(
        &mut self,
        new_status: JobStatus,
        message: Option<String>,
    ) -> OrchestratorResult<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(OrchestratorError::State {
                entity: "job",
                from: self.status.as_str().to_string(),
                to: new_status.as_str().to_string(),
            });
        }

        let now = Utc::now();
        self.transitions.push(JobTransition {
            from: self.status,
            to: new_status,
            at: now,
            message: message.clone(),
        });
        self.status = new_status;
        self.updated_at = now;
        if let Some(msg) = message {
            self.message = Some(msg);
        }

        match new_status {
            JobStatus::Running if self.started_at.is_none() => self.started_at = Some(now),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(now);
            }
            _ => {}
        }

        Ok(())
    }

    /// Update progress. Monotone; 100 is reserved for completion, so
    /// interim updates are capped at 99.
    pub fn set_progress(&mut self, progress: u8, message: Option<String>) -> OrchestratorResult<()> {
        if self.is_terminal() {
            return Err(OrchestratorError::State {
                entity: "job",
                from: self.status.as_str().to_string(),
                to: "progress update".to_string(),
            });
        }
        let capped = progress.min(99);
        if capped > self.progress {
            self.progress = capped;
        }
        if let Some(msg) = message {
            self.message = Some(msg);
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Reset progress for a retry. The only sanctioned decrease.
    pub fn reset_progress_for_retry(&mut self) {
        self.progress = 0;
        self.retry_count += 1;
        self.updated_at = Utc::now();
    }

    /// Complete the job with a result. Sets progress to exactly 100.
    pub fn complete(&mut self, result: serde_json::Value) -> OrchestratorResult<()> {
        self.transition_to(JobStatus::Completed, None)?;
        self.progress = 100;
        self.result = Some(result);
        Ok(())
    }

    /// Fail the job with a typed error.
    pub fn fail(&mut self, error: &OrchestratorError) -> OrchestratorResult<()> {
        self.transition_to(JobStatus::Failed, Some(error.to_string()))?;
        self.error = Some(JobError {
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
        Ok(())
    }
}
