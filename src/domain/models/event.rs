//! Progress event envelope and subscription filters.
//!
//! Every observable state change in the runtime becomes a
//! `ProgressEvent` published on the bus. The wire shape is
//! `{event, data, ts, seq}` with camelCase data fields; readers must
//! tolerate unknown fields, so payload structs only add, never rename.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::models::job::{Job, JobError, JobStatus};

/// Kinds of events emitted by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "job.created")]
    JobCreated,
    #[serde(rename = "job.started")]
    JobStarted,
    #[serde(rename = "job.progress")]
    JobProgress,
    #[serde(rename = "job.paused")]
    JobPaused,
    #[serde(rename = "job.resumed")]
    JobResumed,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.cancelled")]
    JobCancelled,
    #[serde(rename = "task.assigned")]
    TaskAssigned,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobCreated => "job.created",
            Self::JobStarted => "job.started",
            Self::JobProgress => "job.progress",
            Self::JobPaused => "job.paused",
            Self::JobResumed => "job.resumed",
            Self::JobCompleted => "job.completed",
            Self::JobFailed => "job.failed",
            Self::JobCancelled => "job.cancelled",
            Self::TaskAssigned => "task.assigned",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// The event kind announcing a job status.
    pub fn for_job_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => Self::JobCreated,
            JobStatus::Running => Self::JobStarted,
            JobStatus::Paused => Self::JobPaused,
            JobStatus::Completed => Self::JobCompleted,
            JobStatus::Failed => Self::JobFailed,
            JobStatus::Cancelled => Self::JobCancelled,
        }
    }
}

/// Job-scoped progress payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Non-fatal condition riding a progress event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    pub ts: DateTime<Utc>,
}

/// Task-scoped payload for assignment and completion events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub job_id: Uuid,
    pub task_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
}

/// Heartbeat payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {}

/// Event payload variants. Untagged so the wire stays `{event, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    Job(JobProgress),
    Task(TaskProgress),
    Heartbeat(HeartbeatData),
}

impl EventData {
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            Self::Job(p) => Some(p.job_id),
            Self::Task(p) => Some(p.job_id),
            Self::Heartbeat(_) => None,
        }
    }

    pub fn project_id(&self) -> Option<Uuid> {
        match self {
            Self::Job(p) => p.project_id,
            Self::Task(p) => p.project_id,
            Self::Heartbeat(_) => None,
        }
    }
}

/// The broadcast envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event: EventKind,
    pub data: EventData,
    pub ts: DateTime<Utc>,
    /// Per-subscriber sequence number, assigned on delivery
    #[serde(default)]
    pub seq: u64,
}

impl ProgressEvent {
    /// Snapshot a job into the event announcing its current status.
    pub fn from_job(job: &Job) -> Self {
        Self {
            event: EventKind::for_job_status(job.status),
            data: EventData::Job(JobProgress {
                job_id: job.id,
                status: job.status,
                progress: job.progress,
                message: job.message.clone(),
                result: job.result.clone(),
                error: job.error.clone(),
                warning: None,
                project_id: job.project_id,
                ts: job.updated_at,
            }),
            ts: Utc::now(),
            seq: 0,
        }
    }

    /// A `job.progress` event for an interim update.
    pub fn progress(job: &Job, warning: Option<String>) -> Self {
        let mut ev = Self::from_job(job);
        ev.event = EventKind::JobProgress;
        if let EventData::Job(ref mut p) = ev.data {
            p.warning = warning;
        }
        ev
    }

    /// A `job.resumed` event (status alone maps Running to started).
    pub fn resumed(job: &Job) -> Self {
        let mut ev = Self::from_job(job);
        ev.event = EventKind::JobResumed;
        ev
    }

    /// A task-scoped event.
    pub fn task(
        event: EventKind,
        job_id: Uuid,
        task_id: Uuid,
        worker_id: Option<Uuid>,
        error: Option<String>,
    ) -> Self {
        Self {
            event,
            data: EventData::Task(TaskProgress {
                job_id,
                task_id,
                worker_id,
                error,
                project_id: None,
            }),
            ts: Utc::now(),
            seq: 0,
        }
    }

    /// A heartbeat ping.
    pub fn heartbeat() -> Self {
        Self {
            event: EventKind::Heartbeat,
            data: EventData::Heartbeat(HeartbeatData::default()),
            ts: Utc::now(),
            seq: 0,
        }
    }

    pub fn job_id(&self) -> Option<Uuid> {
        self.data.job_id()
    }
}

/// What a subscriber wants to receive.
///
/// Heartbeats are delivered regardless of filter; they are the liveness
/// channel, not a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SubscriptionFilter {
    All,
    Job(Uuid),
    Project(Uuid),
}

impl Default for SubscriptionFilter {
    fn default() -> Self {
        Self::All
    }
}

impl SubscriptionFilter {
    pub fn matches(&self, event: &ProgressEvent) -> bool {
        if event.event == EventKind::Heartbeat {
            return true;
        }
        match self {
            Self::All => true,
            Self::Job(id) => event.data.job_id() == Some(*id),
            Self::Project(id) => event.data.project_id() == Some(*id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::RetryPolicy;

    #[test]
    fn test_event_kind_wire_names() {
        let json = serde_json::to_string(&EventKind::JobCreated).unwrap();
        assert_eq!(json, "\"job.created\"");
        let kind: EventKind = serde_json::from_str("\"task.assigned\"").unwrap();
        assert_eq!(kind, EventKind::TaskAssigned);
    }

    #[test]
    fn test_job_event_wire_shape() {
        let mut job = Job::new(RetryPolicy::default());
        job.transition_to(JobStatus::Running, Some("decomposing".into()))
            .unwrap();
        let ev = ProgressEvent::from_job(&job);
        let value = serde_json::to_value(&ev).unwrap();

        assert_eq!(value["event"], "job.started");
        assert_eq!(value["data"]["jobId"], job.id.to_string());
        assert_eq!(value["data"]["status"], "running");
        assert_eq!(value["data"]["progress"], 0);
        assert_eq!(value["data"]["message"], "decomposing");
    }

    #[test]
    fn test_readers_tolerate_unknown_fields() {
        let raw = r#"{
            "event": "job.progress",
            "data": {
                "jobId": "4b4a7bf0-98ab-4f40-81ad-0d0c81f6b54d",
                "status": "running",
                "progress": 40,
                "ts": "2026-01-01T00:00:00Z",
                "someFutureField": {"nested": true}
            },
            "ts": "2026-01-01T00:00:00Z",
            "seq": 3
        }"#;
        let ev: ProgressEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(ev.event, EventKind::JobProgress);
        assert_eq!(ev.seq, 3);
    }

    #[test]
    fn test_filter_matching() {
        let mut job = Job::new(RetryPolicy::default());
        let project = Uuid::new_v4();
        job.project_id = Some(project);
        let ev = ProgressEvent::from_job(&job);

        assert!(SubscriptionFilter::All.matches(&ev));
        assert!(SubscriptionFilter::Job(job.id).matches(&ev));
        assert!(!SubscriptionFilter::Job(Uuid::new_v4()).matches(&ev));
        assert!(SubscriptionFilter::Project(project).matches(&ev));
        assert!(!SubscriptionFilter::Project(Uuid::new_v4()).matches(&ev));
    }

    #[test]
    fn test_heartbeat_bypasses_filters() {
        let hb = ProgressEvent::heartbeat();
        assert!(SubscriptionFilter::Job(Uuid::new_v4()).matches(&hb));
        assert!(SubscriptionFilter::Project(Uuid::new_v4()).matches(&hb));
    }

    #[test]
    fn test_warning_rides_progress_event() {
        let mut job = Job::new(RetryPolicy::default());
        job.transition_to(JobStatus::Running, None).unwrap();
        let ev = ProgressEvent::progress(&job, Some("oracle unavailable, used fallback".into()));
        assert_eq!(ev.event, EventKind::JobProgress);
        match ev.data {
            EventData::Job(p) => {
                assert_eq!(p.warning.as_deref(), Some("oracle unavailable, used fallback"));
            }
            other => panic!("expected job payload, got {other:?}"),
        }
    }
}
