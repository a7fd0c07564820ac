//! Decomposition session model.
//!
//! One session is the unit of work produced by a single decomposition
//! run for a root task: the atomic tasks, the dependency graph over
//! them, and the bookkeeping counters. Sessions are written to the
//! JobStore exactly once and are immutable after a terminal status.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::models::graph::DependencyGraph;
use crate::domain::models::task::{AtomicTask, TaskSpec};

/// Counters and warnings accumulated during decomposition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RichResults {
    /// Atomic tasks that made it into the session output
    pub successfully_persisted: usize,
    /// Every task the engine generated, including discarded branches
    pub total_generated: usize,
    /// Non-fatal conditions encountered (oracle fallback, cap hits, ...)
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// The output of one decomposition run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionSession {
    /// Session identifier; also the namespace for deterministic task ids
    pub id: Uuid,
    /// The root task the session decomposed
    pub root: TaskSpec,
    /// Atomic tasks in emission order
    pub atomic_tasks: Vec<AtomicTask>,
    /// Dependency graph over the atomic tasks
    pub graph: DependencyGraph,
    /// Counters and warnings
    pub rich_results: RichResults,
}

impl DecompositionSession {
    pub fn new(id: Uuid, root: TaskSpec) -> Self {
        Self {
            id,
            root,
            atomic_tasks: Vec::new(),
            graph: DependencyGraph::new(),
            rich_results: RichResults::default(),
        }
    }

    pub fn task(&self, id: Uuid) -> Option<&AtomicTask> {
        self.atomic_tasks.iter().find(|t| t.id() == id)
    }

    /// Record an emitted atomic task in both the list and the graph.
    pub fn push_atomic(&mut self, task: AtomicTask) {
        self.graph.add_task(&task);
        self.rich_results.successfully_persisted += 1;
        self.atomic_tasks.push(task);
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.rich_results.warnings.push(warning.into());
    }
}
