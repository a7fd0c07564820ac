//! Dispatcher: drives jobs from decomposition through execution.
//!
//! One executor loop per job consumes task completions, replans with
//! the scheduler, and dispatches ready tasks to workers. Completions
//! queued while a plan is being applied are drained before the next
//! planning pass, so overlapping replan triggers collapse into one.
//!
//! Worker liveness is swept periodically: a stale worker goes offline
//! and its running tasks are requeued (counting a retry) until the
//! retry budget is exhausted.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Duration as ChronoDuration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::config::{Limits, SchedulerPolicy, TimeoutKind, TransportKind};
use crate::domain::models::event::{EventKind, ProgressEvent, SubscriptionFilter};
use crate::domain::models::job::JobStatus;
use crate::domain::models::session::DecompositionSession;
use crate::domain::models::task::{AtomicTask, TaskSpec};
use crate::domain::models::worker::{Worker, WorkerStatus};
use crate::domain::ports::event_sink::ChannelSink;
use crate::domain::ports::worker_runtime::{TaskOutcome, WorkerRuntime};
use crate::infrastructure::config::ConfigRegistry;
use crate::infrastructure::persist::SessionStore;
use crate::services::atomicity::ProjectContext;
use crate::services::decomposer::DecompositionEngine;
use crate::services::job_store::JobStore;
use crate::services::progress_bus::ProgressBus;
use crate::services::scheduler::Scheduler;
use crate::services::timeout::{RunOverrides, TimeoutManager};

/// Lifecycle of one atomic task inside a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskRunState {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
    /// No capable worker; parked, not failed
    Blocked,
}

/// Message from a task runner back to its job executor.
#[derive(Debug)]
enum TaskMsg {
    Finished {
        task_id: Uuid,
        worker_id: Uuid,
        /// Dispatch attempt this result belongs to; stale attempts
        /// (superseded after a worker loss) are discarded
        epoch: u64,
        result: OrchestratorResult<TaskOutcome>,
    },
    WorkerLost {
        task_id: Uuid,
        worker_id: Uuid,
    },
}

struct RunningTask {
    job_id: Uuid,
    worker_id: Uuid,
    tx: mpsc::UnboundedSender<TaskMsg>,
}

#[derive(Default)]
struct DispatchState {
    workers: HashMap<Uuid, Worker>,
    running: HashMap<Uuid, RunningTask>,
    job_cancels: HashMap<Uuid, CancellationToken>,
}

/// Orchestrates decomposition, planning, and execution for all jobs.
pub struct Dispatcher {
    store: Arc<JobStore>,
    bus: Arc<ProgressBus>,
    runtime: Arc<dyn WorkerRuntime>,
    engine: Arc<DecompositionEngine>,
    scheduler: Scheduler,
    timeouts: TimeoutManager,
    registry: ConfigRegistry,
    sessions: Option<Arc<SessionStore>>,
    state: Mutex<DispatchState>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<JobStore>,
        bus: Arc<ProgressBus>,
        runtime: Arc<dyn WorkerRuntime>,
        engine: Arc<DecompositionEngine>,
        scheduler_policy: SchedulerPolicy,
        registry: ConfigRegistry,
        sessions: Option<Arc<SessionStore>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            bus,
            runtime,
            engine,
            scheduler: Scheduler::new(scheduler_policy),
            timeouts: TimeoutManager::with_registry(registry.clone()),
            registry,
            sessions,
            state: Mutex::new(DispatchState::default()),
            shutdown,
        }
    }

    // ---- worker pool -------------------------------------------------

    pub fn register_worker(&self, name: impl Into<String>, capabilities: Vec<String>) -> Uuid {
        let worker = Worker::new(name, capabilities);
        let id = worker.id;
        self.state
            .lock()
            .expect("dispatcher lock poisoned")
            .workers
            .insert(id, worker);
        tracing::info!(worker = %id, "worker registered");
        id
    }

    /// Make sure at least `count` generalist workers exist.
    pub fn ensure_default_workers(&self, count: usize) {
        let current = self
            .state
            .lock()
            .expect("dispatcher lock poisoned")
            .workers
            .len();
        for i in current..count {
            self.register_worker(format!("worker-{i}"), Vec::new());
        }
    }

    pub fn worker_heartbeat(&self, id: Uuid) {
        if let Some(worker) = self
            .state
            .lock()
            .expect("dispatcher lock poisoned")
            .workers
            .get_mut(&id)
        {
            worker.heartbeat();
        }
    }

    pub fn workers(&self) -> Vec<Worker> {
        self.state
            .lock()
            .expect("dispatcher lock poisoned")
            .workers
            .values()
            .cloned()
            .collect()
    }

    fn idle_workers(&self) -> Vec<Worker> {
        self.state
            .lock()
            .expect("dispatcher lock poisoned")
            .workers
            .values()
            .filter(|w| w.is_available())
            .cloned()
            .collect()
    }

    /// One liveness pass: offline stale workers, requeue their tasks,
    /// drop workers that stayed offline past the timeout.
    pub fn liveness_sweep(&self) {
        let timeout = ChronoDuration::seconds(
            self.registry
                .snapshot()
                .dispatcher
                .agent_liveness_timeout_secs as i64,
        );
        let mut lost: Vec<(Uuid, Uuid)> = Vec::new();
        {
            let mut state = self.state.lock().expect("dispatcher lock poisoned");
            let stale: Vec<Uuid> = state
                .workers
                .values()
                .filter(|w| w.status != WorkerStatus::Offline && w.is_stale(timeout))
                .map(|w| w.id)
                .collect();
            for id in stale {
                if let Some(worker) = state.workers.get_mut(&id) {
                    tracing::warn!(worker = %id, "worker heartbeat stale, marking offline");
                    let held = worker.current_task_id;
                    worker.mark_offline();
                    if let Some(task_id) = held {
                        lost.push((task_id, id));
                    }
                }
            }
            // Workers offline twice as long as the liveness timeout are
            // removed entirely.
            let drop_after = timeout * 2;
            state.workers.retain(|id, w| {
                let keep = w.status != WorkerStatus::Offline || !w.is_stale(drop_after);
                if !keep {
                    tracing::warn!(worker = %id, "offline worker removed");
                }
                keep
            });
            for (task_id, worker_id) in &lost {
                if let Some(running) = state.running.get(task_id) {
                    let _ = running.tx.send(TaskMsg::WorkerLost {
                        task_id: *task_id,
                        worker_id: *worker_id,
                    });
                }
            }
        }
    }

    /// Periodic liveness loop, cancelled with the runtime.
    pub async fn run_liveness_loop(&self) {
        let interval = std::time::Duration::from_secs(
            self.registry
                .snapshot()
                .dispatcher
                .liveness_sweep_interval_secs
                .max(1),
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.liveness_sweep(),
            }
        }
    }

    // ---- job commands ------------------------------------------------

    /// Create a job for a task spec; decomposition and execution are
    /// spawned in the background.
    pub fn create_job(self: Arc<Self>, spec: TaskSpec) -> OrchestratorResult<Uuid> {
        spec.validate()?;
        let job_id = self.store.create(spec.project_id, None);
        let cancel = self.shutdown.child_token();
        self.state
            .lock()
            .expect("dispatcher lock poisoned")
            .job_cancels
            .insert(job_id, cancel.clone());

        tokio::spawn(async move {
            self.run_job(job_id, spec, cancel).await;
        });
        Ok(job_id)
    }

    pub fn cancel_job(&self, job_id: Uuid) -> OrchestratorResult<()> {
        // The store transition is the source of truth (and idempotent);
        // the token unwinds whatever is still in flight.
        self.store.cancel(job_id)?;
        if let Some(token) = self
            .state
            .lock()
            .expect("dispatcher lock poisoned")
            .job_cancels
            .get(&job_id)
        {
            token.cancel();
        }
        Ok(())
    }

    pub fn pause_job(&self, job_id: Uuid) -> OrchestratorResult<()> {
        self.store.pause(job_id)
    }

    pub fn resume_job(&self, job_id: Uuid) -> OrchestratorResult<()> {
        self.store.resume(job_id)
    }

    // ---- job lifecycle ----------------------------------------------

    async fn run_job(self: Arc<Self>, job_id: Uuid, spec: TaskSpec, cancel: CancellationToken) {
        if let Err(err) = self.store.start(job_id) {
            tracing::error!(job = %job_id, error = %err, "failed to start job");
            return;
        }

        let context = ProjectContext::default();
        let session = match self.engine.decompose(spec, &context, &cancel).await {
            Ok(session) => session,
            Err(err) => {
                self.finish_with_error(job_id, &err);
                return;
            }
        };

        for warning in &session.rich_results.warnings {
            let _ = self
                .store
                .update_progress(job_id, 0, None, Some(warning.clone()));
        }

        if let Err(err) = self.store.put_session(job_id, session.clone()) {
            self.finish_with_error(job_id, &err);
            return;
        }
        if let Some(store) = &self.sessions {
            if let Err(err) = store.save_session(&session).await {
                tracing::warn!(job = %job_id, error = %err, "session persistence failed");
            }
            self.spawn_event_log_forwarder(job_id, session.id, Arc::clone(store));
        }

        let result = Self::execute_session(&self, job_id, session, &cancel).await;
        match result {
            Ok(Some(summary)) => {
                if let Err(err) = self.store.complete(job_id, summary) {
                    tracing::error!(job = %job_id, error = %err, "completing job failed");
                }
            }
            Ok(None) => {
                // Cancelled: the store transition already happened in
                // cancel_job; nothing further to record.
            }
            Err(err) => {
                // Stop whatever sibling tasks are still in flight.
                cancel.cancel();
                self.finish_with_error(job_id, &err);
            }
        }

        self.state
            .lock()
            .expect("dispatcher lock poisoned")
            .job_cancels
            .remove(&job_id);
    }

    /// Mirror this job's bus events into the session's events.log
    /// until a terminal event lands. Heartbeats are acked, not logged.
    fn spawn_event_log_forwarder(
        &self,
        job_id: Uuid,
        session_id: Uuid,
        store: Arc<SessionStore>,
    ) {
        let (sink, mut rx) = ChannelSink::bounded(256);
        // In-process consumer; recorded under the stdio kind since it
        // shares that transport's local delivery semantics.
        let subscriber_id = self.bus.subscribe(
            TransportKind::Stdio,
            SubscriptionFilter::Job(job_id),
            Box::new(sink),
        );
        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.event == EventKind::Heartbeat {
                    bus.ack(subscriber_id);
                    continue;
                }
                let terminal = matches!(
                    event.event,
                    EventKind::JobCompleted | EventKind::JobFailed | EventKind::JobCancelled
                );
                if let Err(err) = store.append_event(session_id, &event).await {
                    tracing::warn!(job = %job_id, error = %err, "event log append failed");
                }
                if terminal {
                    break;
                }
            }
            bus.unsubscribe(subscriber_id);
        });
    }

    fn finish_with_error(&self, job_id: Uuid, err: &OrchestratorError) {
        if matches!(err, OrchestratorError::Cancelled) {
            let _ = self.store.cancel(job_id);
            return;
        }
        if let Err(store_err) = self.store.fail(job_id, err) {
            tracing::error!(job = %job_id, error = %store_err, "failing job failed");
        }
    }

    /// Execute a decomposed session. Returns `Ok(None)` when the job
    /// was cancelled mid-flight.
    async fn execute_session(
        this: &Arc<Self>,
        job_id: Uuid,
        session: DecompositionSession,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Option<serde_json::Value>> {
        let total = session.atomic_tasks.len();
        if total == 0 {
            return Ok(Some(serde_json::json!({
                "tasksCompleted": 0,
                "totalTasks": 0,
            })));
        }

        let limits: Limits = this.registry.limits();
        let policy = this.store.get(job_id).map(|j| j.policy).unwrap_or_default();
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskMsg>();

        let mut states: HashMap<Uuid, TaskRunState> = session
            .atomic_tasks
            .iter()
            .map(|t| (t.id(), TaskRunState::Queued))
            .collect();
        let mut retries: HashMap<Uuid, u32> = HashMap::new();
        let mut epochs: HashMap<Uuid, u64> = HashMap::new();
        let mut done: HashSet<Uuid> = HashSet::new();

        loop {
            if cancel.is_cancelled() {
                this.unwind_cancelled(job_id, &session, &mut states).await;
                return Ok(None);
            }

            let finished = states
                .values()
                .filter(|s| {
                    matches!(
                        s,
                        TaskRunState::Done | TaskRunState::Blocked | TaskRunState::Cancelled
                    )
                })
                .count();
            if finished == total {
                let blocked: Vec<String> = states
                    .iter()
                    .filter(|(_, s)| **s == TaskRunState::Blocked)
                    .map(|(id, _)| id.to_string())
                    .collect();
                return Ok(Some(serde_json::json!({
                    "tasksCompleted": done.len(),
                    "totalTasks": total,
                    "blockedNoCapability": blocked,
                })));
            }

            let paused = this
                .store
                .get(job_id)
                .map(|j| j.status == JobStatus::Paused)
                .unwrap_or(false);

            if !paused {
                Self::dispatch_ready(this, job_id, &session, &mut states, &mut epochs, &done, &limits, &tx)?;
            }

            // Wait for the next completion, then drain everything that
            // queued up meanwhile so one replan covers the batch.
            let msg = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    this.unwind_cancelled(job_id, &session, &mut states).await;
                    return Ok(None);
                }
                msg = rx.recv() => msg,
                // Re-check pause state and liveness periodically even
                // with nothing in flight.
                () = tokio::time::sleep(std::time::Duration::from_millis(200)) => continue,
            };
            let Some(first) = msg else { continue };

            let mut batch = vec![first];
            while let Ok(more) = rx.try_recv() {
                batch.push(more);
            }

            for msg in batch {
                match msg {
                    TaskMsg::Finished {
                        task_id,
                        worker_id,
                        epoch,
                        result,
                    } => {
                        if epochs.get(&task_id).copied().unwrap_or(0) != epoch {
                            tracing::debug!(task = %task_id, epoch, "stale task result ignored");
                            continue;
                        }
                        this.release_worker(worker_id, task_id);
                        match result {
                            Ok(_) => {
                                states.insert(task_id, TaskRunState::Done);
                                done.insert(task_id);
                                this.bus.publish(&ProgressEvent::task(
                                    EventKind::TaskCompleted,
                                    job_id,
                                    task_id,
                                    Some(worker_id),
                                    None,
                                ));
                                let progress =
                                    ((done.len() * 99) / total).min(99) as u8;
                                let _ = this.store.update_progress(
                                    job_id,
                                    progress,
                                    Some(format!("{}/{} tasks done", done.len(), total)),
                                    None,
                                );
                            }
                            Err(err) => {
                                let attempts = retries.entry(task_id).or_insert(0);
                                this.bus.publish(&ProgressEvent::task(
                                    EventKind::TaskFailed,
                                    job_id,
                                    task_id,
                                    Some(worker_id),
                                    Some(err.to_string()),
                                ));
                                if *attempts < policy.max_retries && err.is_retryable() {
                                    *attempts += 1;
                                    states.insert(task_id, TaskRunState::Queued);
                                    tracing::warn!(
                                        task = %task_id,
                                        attempt = *attempts,
                                        "task failed, requeued"
                                    );
                                } else {
                                    states.insert(task_id, TaskRunState::Failed);
                                    this.cancel_outstanding(&mut states);
                                    return Err(err);
                                }
                            }
                        }
                    }
                    TaskMsg::WorkerLost { task_id, worker_id } => {
                        if states.get(&task_id) != Some(&TaskRunState::Running) {
                            continue;
                        }
                        this.release_worker(worker_id, task_id);
                        // The superseded runner's eventual result must
                        // not complete the requeued attempt.
                        *epochs.entry(task_id).or_insert(0) += 1;
                        let attempts = retries.entry(task_id).or_insert(0);
                        *attempts += 1;
                        if *attempts > policy.max_retries {
                            states.insert(task_id, TaskRunState::Failed);
                            this.cancel_outstanding(&mut states);
                            return Err(OrchestratorError::Validation(format!(
                                "task {task_id} lost its worker {} times, retry budget exhausted",
                                *attempts
                            )));
                        }
                        states.insert(task_id, TaskRunState::Queued);
                        tracing::warn!(task = %task_id, worker = %worker_id,
                            "worker lost, task requeued");
                    }
                }
            }
        }
    }

    /// Plan and dispatch every ready task the worker pool can absorb.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_ready(
        this: &Arc<Self>,
        job_id: Uuid,
        session: &DecompositionSession,
        states: &mut HashMap<Uuid, TaskRunState>,
        epochs: &mut HashMap<Uuid, u64>,
        done: &HashSet<Uuid>,
        limits: &Limits,
        tx: &mpsc::UnboundedSender<TaskMsg>,
    ) -> OrchestratorResult<()> {
        let queued: Vec<&AtomicTask> = session
            .atomic_tasks
            .iter()
            .filter(|t| states.get(&t.id()) == Some(&TaskRunState::Queued))
            .collect();
        if queued.is_empty() {
            return Ok(());
        }

        let workers = this.idle_workers();
        if workers.is_empty() {
            return Ok(());
        }

        // Plan the queued tasks. In-flight tasks count as satisfied for
        // readiness (the plan may order their dependents), but actual
        // dispatch below still gates on the real `done` set.
        let planning_set: Vec<AtomicTask> = queued.iter().map(|t| (*t).clone()).collect();
        let mut planning_done = done.clone();
        for (id, state) in states.iter() {
            if *state == TaskRunState::Running {
                planning_done.insert(*id);
            }
        }
        let plan = this
            .scheduler
            .plan(&planning_set, &session.graph, &workers, &planning_done)?;

        for task_id in &plan.blocked_no_capability {
            this.mark_blocked_with_dependents(*task_id, session, states);
        }

        let running_now = states
            .values()
            .filter(|s| **s == TaskRunState::Running)
            .count();
        let budget = limits.max_concurrent_tasks.saturating_sub(running_now);

        let mut dispatched = 0usize;
        for task_id in plan.ordered_tasks() {
            if dispatched >= budget {
                break;
            }
            // Only dispatch what is ready against the real `done` set;
            // later plan entries wait for the next pass.
            let deps_ready = session
                .graph
                .dependencies_of(task_id)
                .map(|deps| deps.iter().all(|d| done.contains(d)))
                .unwrap_or(true);
            if !deps_ready {
                continue;
            }
            let Some(assignment) = plan.assignments.get(&task_id) else {
                continue;
            };
            let Some(task) = session.task(task_id) else {
                continue;
            };
            if !this.try_occupy_worker(assignment.worker_id, task_id) {
                continue;
            }

            states.insert(task_id, TaskRunState::Running);
            dispatched += 1;
            this.bus.publish(&ProgressEvent::task(
                EventKind::TaskAssigned,
                job_id,
                task_id,
                Some(assignment.worker_id),
                None,
            ));
            let epoch = epochs.get(&task_id).copied().unwrap_or(0);
            Self::spawn_task_runner(this, job_id, task.clone(), assignment.worker_id, epoch, tx.clone());
        }
        Ok(())
    }

    fn spawn_task_runner(
        this: &Arc<Self>,
        job_id: Uuid,
        task: AtomicTask,
        worker_id: Uuid,
        epoch: u64,
        tx: mpsc::UnboundedSender<TaskMsg>,
    ) {
        let task_id = task.id();
        {
            let mut state = this.state.lock().expect("dispatcher lock poisoned");
            state.running.insert(
                task_id,
                RunningTask {
                    job_id,
                    worker_id,
                    tx: tx.clone(),
                },
            );
        }

        let dispatcher = Arc::clone(this);
        let cancel = this
            .state
            .lock()
            .expect("dispatcher lock poisoned")
            .job_cancels
            .get(&job_id)
            .cloned()
            .unwrap_or_else(CancellationToken::new);

        tokio::spawn(async move {
            let slack = dispatcher.registry.scheduler_policy().execution_slack_minutes;
            let budget = std::time::Duration::from_secs_f64(
                (task.weight() + slack.max(0.0)) * 60.0,
            );
            let runtime = Arc::clone(&dispatcher.runtime);
            let task_ref = task.clone();

            let outcome = dispatcher
                .timeouts
                .run(
                    TimeoutKind::TaskExecution,
                    move || {
                        let runtime = Arc::clone(&runtime);
                        let task = task_ref.clone();
                        async move { runtime.execute(worker_id, &task).await }
                    },
                    RunOverrides::timeout(budget),
                    &cancel,
                )
                .await;

            let result = outcome.into_value();
            if matches!(result, Err(OrchestratorError::Cancelled)) {
                // Best-effort abort toward the worker; the executor
                // handles state transitions during unwind.
                dispatcher.runtime.abort(worker_id, task_id).await;
            }
            // The runner frees its own worker so the slot never leaks
            // even when the job executor has already returned.
            dispatcher.release_worker(worker_id, task_id);
            let _ = tx.send(TaskMsg::Finished {
                task_id,
                worker_id,
                epoch,
                result,
            });
        });
    }

    /// Park a task with no capable worker, along with every transitive
    /// dependent: none of them can ever run in this worker pool.
    fn mark_blocked_with_dependents(
        &self,
        task_id: Uuid,
        session: &DecompositionSession,
        states: &mut HashMap<Uuid, TaskRunState>,
    ) {
        let mut queue = vec![task_id];
        while let Some(id) = queue.pop() {
            let current = states.get(&id).copied();
            if matches!(current, Some(TaskRunState::Queued)) || id == task_id {
                states.insert(id, TaskRunState::Blocked);
                tracing::warn!(task = %id, "blocked: no capable worker");
                if let Some(dependents) = session.graph.dependents_of(id) {
                    queue.extend(dependents.iter().copied());
                }
            }
        }
    }

    fn try_occupy_worker(&self, worker_id: Uuid, task_id: Uuid) -> bool {
        let mut state = self.state.lock().expect("dispatcher lock poisoned");
        match state.workers.get_mut(&worker_id) {
            Some(worker) if worker.is_available() => {
                worker.assign(task_id);
                true
            }
            _ => false,
        }
    }

    fn release_worker(&self, worker_id: Uuid, task_id: Uuid) {
        let mut state = self.state.lock().expect("dispatcher lock poisoned");
        if let Some(worker) = state.workers.get_mut(&worker_id) {
            if worker.current_task_id == Some(task_id) {
                worker.release();
            }
        }
        state.running.remove(&task_id);
    }

    fn cancel_outstanding(&self, states: &mut HashMap<Uuid, TaskRunState>) {
        for (_, run_state) in states.iter_mut() {
            if matches!(run_state, TaskRunState::Queued | TaskRunState::Running) {
                *run_state = TaskRunState::Cancelled;
            }
        }
    }

    /// Transition every non-terminal task to cancelled and abort the
    /// ones still on workers.
    async fn unwind_cancelled(
        &self,
        job_id: Uuid,
        session: &DecompositionSession,
        states: &mut HashMap<Uuid, TaskRunState>,
    ) {
        let running: Vec<(Uuid, Uuid)> = {
            let state = self.state.lock().expect("dispatcher lock poisoned");
            session
                .atomic_tasks
                .iter()
                .filter_map(|t| {
                    state
                        .running
                        .get(&t.id())
                        .map(|r| (t.id(), r.worker_id))
                })
                .collect()
        };
        for (task_id, worker_id) in running {
            self.runtime.abort(worker_id, task_id).await;
            self.release_worker(worker_id, task_id);
        }
        self.cancel_outstanding(states);
        // The cancelled transition itself was already recorded by
        // cancel_job; the unwind only guarantees resource release.
        let _ = job_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::{BusConfig, NlpMethod, TransportKind};
    use crate::domain::models::event::SubscriptionFilter;
    use crate::domain::ports::event_sink::ChannelSink;
    use crate::domain::ports::oracle::{LanguageOracle, ScriptedOracle};
    use crate::domain::ports::worker_runtime::InlineWorkerRuntime;
    use crate::services::atomicity::AtomicityDetector;

    fn test_dispatcher(
        oracle: ScriptedOracle,
        runtime: Arc<InlineWorkerRuntime>,
    ) -> (Arc<Dispatcher>, Arc<JobStore>, tokio::sync::mpsc::Receiver<ProgressEvent>) {
        let registry = ConfigRegistry::get_instance();
        let bus = Arc::new(ProgressBus::new(BusConfig {
            buffer_capacity: 256,
            ..BusConfig::default()
        }));
        let (sink, rx) = ChannelSink::bounded(256);
        bus.subscribe(TransportKind::Stdio, SubscriptionFilter::All, Box::new(sink));

        let store = Arc::new(JobStore::new(Arc::clone(&bus), registry.clone()));
        let oracle: Arc<dyn LanguageOracle> = Arc::new(oracle);
        let timeouts = TimeoutManager::with_registry(registry.clone());
        let detector = Arc::new(AtomicityDetector::new(
            Arc::clone(&oracle),
            timeouts.clone(),
            NlpMethod::Hybrid,
            0.3,
        ));
        let engine = Arc::new(DecompositionEngine::new(
            detector,
            oracle,
            timeouts,
            Limits::default(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            bus,
            runtime,
            engine,
            SchedulerPolicy::default(),
            registry,
            None,
            CancellationToken::new(),
        ));
        (dispatcher, store, rx)
    }

    fn atomic_reply() -> String {
        r#"{"isAtomic": true, "confidence": 0.9, "reasoning": "small"}"#.to_string()
    }

    fn simple_spec() -> TaskSpec {
        TaskSpec::new("Add field", "one small change")
            .with_estimate(5.0)
            .with_file_path("src/a.rs")
            .with_criterion("field exists")
    }

    async fn wait_for_status(
        store: &JobStore,
        job_id: Uuid,
        status: JobStatus,
    ) -> crate::domain::models::job::Job {
        for _ in 0..200 {
            if let Some(job) = store.get(job_id) {
                if job.status == status {
                    return job;
                }
                assert!(
                    !(job.status.is_terminal() && job.status != status),
                    "job reached unexpected terminal status {:?}",
                    job.status
                );
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("job never reached {status:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_atomic_job_completes() {
        let runtime = Arc::new(InlineWorkerRuntime::new());
        let (dispatcher, store, _rx) =
            test_dispatcher(ScriptedOracle::with_replies(vec![atomic_reply()]), runtime);
        dispatcher.ensure_default_workers(2);

        let job_id = dispatcher.clone().create_job(simple_spec()).unwrap();
        let job = wait_for_status(&store, job_id, JobStatus::Completed).await;
        assert_eq!(job.progress, 100);
        assert_eq!(job.result.as_ref().unwrap()["tasksCompleted"], 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_task_fails_job_with_kind() {
        let runtime = Arc::new(InlineWorkerRuntime::new());
        runtime.on_type("standard", |_| {
            Err(OrchestratorError::Validation("worker rejected input".into()))
        });
        let (dispatcher, store, _rx) =
            test_dispatcher(ScriptedOracle::with_replies(vec![atomic_reply()]), runtime);
        dispatcher.ensure_default_workers(1);

        let job_id = dispatcher.clone().create_job(simple_spec()).unwrap();
        let job = wait_for_status(&store, job_id, JobStatus::Failed).await;
        assert_eq!(job.error.as_ref().unwrap().kind, "validation");
        assert!(job.progress < 100);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_reaches_terminal_state() {
        // An execution that blocks forever; cancellation must still
        // drive the job to a terminal status.
        let runtime = Arc::new(InlineWorkerRuntime::new());
        let (dispatcher, store, _rx) = test_dispatcher(
            ScriptedOracle::with_replies(vec![atomic_reply()]),
            Arc::clone(&runtime),
        );
        dispatcher.ensure_default_workers(1);

        // Stall the worker by handling the type with a long sleep via a
        // timeout larger than the test: simplest is a task estimate big
        // enough that cancel lands first.
        runtime.on_type("standard", |_| {
            std::thread::sleep(std::time::Duration::from_millis(100));
            Ok(serde_json::json!({}))
        });

        let job_id = dispatcher.clone().create_job(simple_spec()).unwrap();
        wait_for_status(&store, job_id, JobStatus::Running).await;
        dispatcher.cancel_job(job_id).unwrap();

        let job = wait_for_status(&store, job_id, JobStatus::Cancelled).await;
        assert!(job.is_terminal());

        // Cancel is idempotent after the fact.
        dispatcher.cancel_job(job_id).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_decomposition_failure_fails_job() {
        // Root passes rules, oracle verdict says split, split errors
        // out; the engine degrades to atomic-by-cap, so instead force a
        // validation failure with an invalid spec.
        let runtime = Arc::new(InlineWorkerRuntime::new());
        let (dispatcher, _store, _rx) =
            test_dispatcher(ScriptedOracle::with_replies(vec![]), runtime);
        let bad = TaskSpec::new("", "missing title");
        assert!(dispatcher.clone().create_job(bad).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pause_gates_dispatch() {
        let runtime = Arc::new(InlineWorkerRuntime::new());
        let (dispatcher, store, _rx) = test_dispatcher(
            ScriptedOracle::with_replies(vec![atomic_reply()]),
            Arc::clone(&runtime),
        );
        // No workers yet: the executor loop spins without dispatching.
        let job_id = dispatcher.clone().create_job(simple_spec()).unwrap();
        wait_for_status(&store, job_id, JobStatus::Running).await;

        dispatcher.pause_job(job_id).unwrap();
        wait_for_status(&store, job_id, JobStatus::Paused).await;

        // Workers arriving while paused must not be used.
        dispatcher.ensure_default_workers(1);
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(store.get(job_id).unwrap().status, JobStatus::Paused);

        dispatcher.resume_job(job_id).unwrap();
        let job = wait_for_status(&store, job_id, JobStatus::Completed).await;
        assert_eq!(job.progress, 100);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_registration_and_heartbeat() {
        let runtime = Arc::new(InlineWorkerRuntime::new());
        let (dispatcher, _store, _rx) =
            test_dispatcher(ScriptedOracle::with_replies(vec![]), runtime);
        let id = dispatcher.register_worker("w1", vec!["code".to_string()]);
        assert_eq!(dispatcher.workers().len(), 1);
        dispatcher.worker_heartbeat(id);
        let worker = dispatcher
            .workers()
            .into_iter()
            .find(|w| w.id == id)
            .unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_liveness_sweep_offlines_and_removes_stale_workers() {
        let runtime = Arc::new(InlineWorkerRuntime::new());
        let (dispatcher, _store, _rx) =
            test_dispatcher(ScriptedOracle::with_replies(vec![]), runtime);
        let id = dispatcher.register_worker("flaky", Vec::new());

        // Age the heartbeat past the liveness timeout (90s default)
        // but inside the removal window (twice the timeout).
        {
            let mut state = dispatcher.state.lock().unwrap();
            let worker = state.workers.get_mut(&id).unwrap();
            worker.last_heartbeat_at = chrono::Utc::now() - ChronoDuration::seconds(120);
        }
        dispatcher.liveness_sweep();
        let worker = dispatcher
            .workers()
            .into_iter()
            .find(|w| w.id == id)
            .unwrap();
        assert_eq!(worker.status, WorkerStatus::Offline);

        // Once offline longer than twice the timeout, it is removed.
        {
            let mut state = dispatcher.state.lock().unwrap();
            let worker = state.workers.get_mut(&id).unwrap();
            worker.last_heartbeat_at = chrono::Utc::now() - ChronoDuration::seconds(600);
        }
        dispatcher.liveness_sweep();
        assert!(dispatcher.workers().is_empty());

        // A fresh heartbeat would have revived it instead.
        let id2 = dispatcher.register_worker("healthy", Vec::new());
        dispatcher.worker_heartbeat(id2);
        dispatcher.liveness_sweep();
        assert_eq!(dispatcher.workers().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_event_log_persisted_with_session() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::new(dir.path()));

        let registry = ConfigRegistry::get_instance();
        let bus = Arc::new(ProgressBus::new(BusConfig {
            buffer_capacity: 256,
            ..BusConfig::default()
        }));
        let store = Arc::new(JobStore::new(Arc::clone(&bus), registry.clone()));
        let oracle: Arc<dyn LanguageOracle> =
            Arc::new(ScriptedOracle::with_replies(vec![atomic_reply()]));
        let timeouts = TimeoutManager::with_registry(registry.clone());
        let detector = Arc::new(AtomicityDetector::new(
            Arc::clone(&oracle),
            timeouts.clone(),
            NlpMethod::Hybrid,
            0.3,
        ));
        let engine = Arc::new(DecompositionEngine::new(
            detector,
            oracle,
            timeouts,
            Limits::default(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            bus,
            Arc::new(InlineWorkerRuntime::new()),
            engine,
            SchedulerPolicy::default(),
            registry,
            Some(Arc::clone(&sessions)),
            CancellationToken::new(),
        ));
        dispatcher.ensure_default_workers(1);

        let spec = simple_spec();
        let session_id = spec.id;
        let job_id = dispatcher.clone().create_job(spec).unwrap();
        wait_for_status(&store, job_id, JobStatus::Completed).await;

        // definition.json and graph.json exist for the session.
        let restored = sessions.load_session(session_id).await.unwrap();
        assert_eq!(restored.atomic_tasks.len(), 1);

        // The forwarder appended the lifecycle to events.log.
        let mut events = Vec::new();
        for _ in 0..100 {
            events = sessions.read_events(session_id).await.unwrap();
            if events
                .iter()
                .any(|e| e.event == EventKind::JobCompleted)
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(events.iter().any(|e| e.event == EventKind::JobCompleted));
        assert!(events.iter().all(|e| e.event != EventKind::Heartbeat));
    }
}
