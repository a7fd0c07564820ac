//! In-memory job store with status-machine enforcement.
//!
//! All mutations are atomic with respect to status transitions; illegal
//! transitions fail fast with a state error. Every mutation emits an
//! event to the progress bus. Terminal jobs are pruned once they age
//! past the configured retention.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::event::ProgressEvent;
use crate::domain::models::job::{Job, JobStatus};
use crate::domain::models::session::DecompositionSession;
use crate::infrastructure::config::ConfigRegistry;
use crate::services::progress_bus::ProgressBus;

#[derive(Default)]
struct StoreState {
    jobs: HashMap<Uuid, Job>,
    /// Each job's session, written exactly once.
    sessions: HashMap<Uuid, DecompositionSession>,
}

/// Counts per status, for status output.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// In-memory map of jobs keyed by id.
pub struct JobStore {
    state: Mutex<StoreState>,
    bus: Arc<ProgressBus>,
    registry: ConfigRegistry,
}

impl JobStore {
    pub fn new(bus: Arc<ProgressBus>, registry: ConfigRegistry) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            bus,
            registry,
        }
    }

    /// Create a new pending job and announce it.
    pub fn create(&self, project_id: Option<Uuid>, ancestor: Option<Uuid>) -> Uuid {
        let mut job = Job::new(self.registry.retry_policy());
        job.project_id = project_id;
        job.ancestor_job_id = ancestor;
        let id = job.id;

        let event = ProgressEvent::from_job(&job);
        self.state
            .lock()
            .expect("store lock poisoned")
            .jobs
            .insert(id, job);
        self.bus.publish(&event);
        tracing::info!(job = %id, "job created");
        id
    }

    fn mutate<F>(&self, id: Uuid, f: F) -> OrchestratorResult<ProgressEvent>
    where
        F: FnOnce(&mut Job) -> OrchestratorResult<ProgressEvent>,
    {
        let mut state = self.state.lock().expect("store lock poisoned");
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(OrchestratorError::JobNotFound(id))?;
        f(job)
    }

    pub fn start(&self, id: Uuid) -> OrchestratorResult<()> {
        let event = self.mutate(id, |job| {
            job.transition_to(JobStatus::Running, None)?;
            Ok(ProgressEvent::from_job(job))
        })?;
        self.bus.publish(&event);
        Ok(())
    }

    /// Update progress (0..100) with an optional message and warning.
    pub fn update_progress(
        &self,
        id: Uuid,
        progress: u8,
        message: Option<String>,
        warning: Option<String>,
    ) -> OrchestratorResult<()> {
        let event = self.mutate(id, |job| {
            job.set_progress(progress, message)?;
            Ok(ProgressEvent::progress(job, warning))
        })?;
        self.bus.publish(&event);
        Ok(())
    }

    pub fn complete(&self, id: Uuid, result: serde_json::Value) -> OrchestratorResult<()> {
        let event = self.mutate(id, |job| {
            job.complete(result)?;
            Ok(ProgressEvent::from_job(job))
        })?;
        self.bus.publish(&event);
        tracing::info!(job = %id, "job completed");
        Ok(())
    }

    pub fn fail(&self, id: Uuid, error: &OrchestratorError) -> OrchestratorResult<()> {
        let event = self.mutate(id, |job| {
            job.fail(error)?;
            Ok(ProgressEvent::from_job(job))
        })?;
        self.bus.publish(&event);
        tracing::warn!(job = %id, kind = error.kind(), "job failed");
        Ok(())
    }

    /// Cancel a job. Cancelling an already-cancelled job is an Ok no-op.
    pub fn cancel(&self, id: Uuid) -> OrchestratorResult<()> {
        let event = {
            let mut state = self.state.lock().expect("store lock poisoned");
            let job = state
                .jobs
                .get_mut(&id)
                .ok_or(OrchestratorError::JobNotFound(id))?;
            if job.status == JobStatus::Cancelled {
                return Ok(());
            }
            job.transition_to(JobStatus::Cancelled, None)?;
            ProgressEvent::from_job(job)
        };
        self.bus.publish(&event);
        tracing::info!(job = %id, "job cancelled");
        Ok(())
    }

    pub fn pause(&self, id: Uuid) -> OrchestratorResult<()> {
        let event = self.mutate(id, |job| {
            job.transition_to(JobStatus::Paused, None)?;
            Ok(ProgressEvent::from_job(job))
        })?;
        self.bus.publish(&event);
        Ok(())
    }

    pub fn resume(&self, id: Uuid) -> OrchestratorResult<()> {
        let event = self.mutate(id, |job| {
            if job.status != JobStatus::Paused {
                return Err(OrchestratorError::State {
                    entity: "job",
                    from: job.status.as_str().to_string(),
                    to: "running".to_string(),
                });
            }
            job.transition_to(JobStatus::Running, None)?;
            Ok(ProgressEvent::resumed(job))
        })?;
        self.bus.publish(&event);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.state
            .lock()
            .expect("store lock poisoned")
            .jobs
            .get(&id)
            .cloned()
    }

    /// List jobs, optionally filtered by status, newest first.
    pub fn list(&self, status: Option<JobStatus>) -> Vec<Job> {
        let state = self.state.lock().expect("store lock poisoned");
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock().expect("store lock poisoned");
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Paused => stats.paused += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Attach a session to its job. Written exactly once; a second
    /// write is a state error.
    pub fn put_session(&self, job_id: Uuid, session: DecompositionSession) -> OrchestratorResult<()> {
        let mut state = self.state.lock().expect("store lock poisoned");
        if !state.jobs.contains_key(&job_id) {
            return Err(OrchestratorError::JobNotFound(job_id));
        }
        if state.sessions.contains_key(&job_id) {
            return Err(OrchestratorError::State {
                entity: "session",
                from: "written".to_string(),
                to: "rewritten".to_string(),
            });
        }
        state.sessions.insert(job_id, session);
        Ok(())
    }

    pub fn session(&self, job_id: Uuid) -> Option<DecompositionSession> {
        self.state
            .lock()
            .expect("store lock poisoned")
            .sessions
            .get(&job_id)
            .cloned()
    }

    /// Remove terminal jobs older than the configured retention.
    /// Returns how many were pruned.
    pub fn prune_expired(&self) -> usize {
        let retention_hours = self.registry.snapshot().persistence.retention_hours;
        let cutoff = Utc::now() - ChronoDuration::hours(retention_hours as i64);
        let mut state = self.state.lock().expect("store lock poisoned");
        let expired: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| {
                j.is_terminal() && j.completed_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|j| j.id)
            .collect();
        for id in &expired {
            state.jobs.remove(id);
            state.sessions.remove(id);
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "pruned expired terminal jobs");
        }
        expired.len()
    }

    /// Periodic pruning tick, cancelled with the runtime.
    pub async fn run_prune_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.prune_expired();
                }
            }
        }
    }

    /// Test hook: drop all jobs and sessions.
    #[doc(hidden)]
    pub fn reset_for_tests(&self) {
        let mut state = self.state.lock().expect("store lock poisoned");
        state.jobs.clear();
        state.sessions.clear();
    }
}
