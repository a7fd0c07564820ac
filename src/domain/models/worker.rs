//! Worker domain model.
//!
//! Workers are the execution slots the scheduler plans against. They
//! advertise capability tags; a task whose type tag is not covered by
//! any worker is blocked, never failed.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }
}

/// An execution slot with capability tags and a liveness heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Unique identifier
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Task-type tags this worker can execute
    pub capabilities: BTreeSet<String>,
    /// Current status
    pub status: WorkerStatus,
    /// Task currently held, if busy
    pub current_task_id: Option<Uuid>,
    /// Last heartbeat observed
    pub last_heartbeat_at: DateTime<Utc>,
    /// When the worker registered
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(name: impl Into<String>, capabilities: impl IntoIterator<Item = String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            capabilities: capabilities.into_iter().collect(),
            status: WorkerStatus::Idle,
            current_task_id: None,
            last_heartbeat_at: now,
            registered_at: now,
        }
    }

    /// Whether this worker can execute a task of the given type.
    ///
    /// An empty capability set means a generalist worker.
    pub fn can_handle(&self, task_type: &str) -> bool {
        self.capabilities.is_empty() || self.capabilities.contains(task_type)
    }

    pub fn is_available(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    /// Record a heartbeat, reviving an offline worker.
    pub fn heartbeat(&mut self) {
        self.last_heartbeat_at = Utc::now();
        if self.status == WorkerStatus::Offline {
            self.status = WorkerStatus::Idle;
        }
    }

    /// Whether the heartbeat is older than the liveness timeout.
    pub fn is_stale(&self, liveness_timeout: Duration) -> bool {
        Utc::now() - self.last_heartbeat_at > liveness_timeout
    }

    /// Occupy the worker with a task.
    pub fn assign(&mut self, task_id: Uuid) {
        self.status = WorkerStatus::Busy;
        self.current_task_id = Some(task_id);
    }

    /// Release the worker back to the idle pool.
    pub fn release(&mut self) {
        self.status = WorkerStatus::Idle;
        self.current_task_id = None;
    }

    /// Mark the worker offline, dropping any held task reference.
    pub fn mark_offline(&mut self) {
        self.status = WorkerStatus::Offline;
        self.current_task_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_matching() {
        let w = Worker::new("rust-worker", vec!["code".to_string(), "test".to_string()]);
        assert!(w.can_handle("code"));
        assert!(!w.can_handle("design"));

        let generalist = Worker::new("any", Vec::new());
        assert!(generalist.can_handle("design"));
    }

    #[test]
    fn test_assign_release_cycle() {
        let mut w = Worker::new("w", Vec::new());
        assert!(w.is_available());

        let task = Uuid::new_v4();
        w.assign(task);
        assert_eq!(w.status, WorkerStatus::Busy);
        assert_eq!(w.current_task_id, Some(task));
        assert!(!w.is_available());

        w.release();
        assert!(w.is_available());
        assert!(w.current_task_id.is_none());
    }

    #[test]
    fn test_heartbeat_revives_offline_worker() {
        let mut w = Worker::new("w", Vec::new());
        w.mark_offline();
        assert_eq!(w.status, WorkerStatus::Offline);
        w.heartbeat();
        assert_eq!(w.status, WorkerStatus::Idle);
    }

    #[test]
    fn test_staleness() {
        let mut w = Worker::new("w", Vec::new());
        assert!(!w.is_stale(Duration::seconds(60)));
        w.last_heartbeat_at = Utc::now() - Duration::seconds(120);
        assert!(w.is_stale(Duration::seconds(60)));
    }
}
