//! Worker runtime port.
//!
//! The dispatcher drives task execution through this trait; the real
//! implementation lives with whatever agent substrate the deployment
//! wires in. The inline runtime here executes closures and powers the
//! test suite.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::OrchestratorResult;
use crate::domain::models::task::AtomicTask;

/// Outcome of one task execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    /// Free-form result payload
    pub output: serde_json::Value,
}

/// Executes atomic tasks on behalf of a worker slot.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Execute a task to completion. Implementations should return
    /// promptly after observing an abort for the task.
    async fn execute(&self, worker_id: Uuid, task: &AtomicTask) -> OrchestratorResult<TaskOutcome>;

    /// Best-effort abort signal for a running task.
    async fn abort(&self, worker_id: Uuid, task_id: Uuid);
}

type TaskHandler =
    Arc<dyn Fn(&AtomicTask) -> OrchestratorResult<serde_json::Value> + Send + Sync>;

/// In-process runtime executing a configurable handler per task type.
///
/// Defaults to echoing the task id, which is enough for scheduling and
/// lifecycle tests.
pub struct InlineWorkerRuntime {
    handlers: Mutex<HashMap<String, TaskHandler>>,
    aborted: Mutex<Vec<Uuid>>,
}

impl Default for InlineWorkerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InlineWorkerRuntime {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            aborted: Mutex::new(Vec::new()),
        }
    }

    /// Install a handler for a task type.
    pub fn on_type(
        &self,
        task_type: impl Into<String>,
        handler: impl Fn(&AtomicTask) -> OrchestratorResult<serde_json::Value> + Send + Sync + 'static,
    ) {
        self.handlers
            .lock()
            .expect("handler lock poisoned")
            .insert(task_type.into(), Arc::new(handler));
    }

    /// Task ids that received an abort signal.
    pub fn aborted_tasks(&self) -> Vec<Uuid> {
        self.aborted.lock().expect("abort lock poisoned").clone()
    }
}

#[async_trait]
impl WorkerRuntime for InlineWorkerRuntime {
    async fn execute(&self, _worker_id: Uuid, task: &AtomicTask) -> OrchestratorResult<TaskOutcome> {
        let handler = self
            .handlers
            .lock()
            .expect("handler lock poisoned")
            .get(&task.spec.task_type)
            .cloned();
        let output = match handler {
            Some(h) => h(task)?,
            None => serde_json::json!({ "taskId": task.id() }),
        };
        Ok(TaskOutcome {
            task_id: task.id(),
            output,
        })
    }

    async fn abort(&self, _worker_id: Uuid, task_id: Uuid) {
        self.aborted
            .lock()
            .expect("abort lock poisoned")
            .push(task_id);
    }
}
