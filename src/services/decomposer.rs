//! Recursive decomposition of task specs into atomic tasks.
//!
//! Each node is judged by the atomicity detector; non-atomic nodes are
//! split by the oracle and their children recursed, bounded by the
//! depth and total-task caps. When a cap (or an unusable oracle) stops
//! a branch, the remaining node is emitted atomic-by-cap with a warning
//! so no work is lost.
//!
//! The engine is deterministic given fixed oracle responses: task ids
//! come from a counter seeded by the session id, and children inherit
//! the parent's creation timestamp instead of sampling the clock.

use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::config::{Limits, TimeoutKind};
use crate::domain::models::session::DecompositionSession;
use crate::domain::models::task::{derive_task_id, AtomicTask, TaskPriority, TaskSpec};
use crate::domain::ports::oracle::{LanguageOracle, OracleQueryKind};
use crate::services::atomicity::{AtomicityDetector, ProjectContext};
use crate::services::extract_json_from_response;
use crate::services::timeout::{RunOverrides, TimeoutManager};

/// Child task proposed by a split reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SplitChild {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    task_type: Option<String>,
    #[serde(default)]
    estimated_minutes: f64,
    #[serde(default)]
    file_paths: Vec<String>,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
    /// Indices of sibling tasks this child depends on
    #[serde(default)]
    depends_on: Vec<usize>,
}

/// The oracle's split reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SplitReply {
    #[serde(default)]
    tasks: Vec<SplitChild>,
}

/// Recursive decomposition engine.
pub struct DecompositionEngine {
    detector: Arc<AtomicityDetector>,
    oracle: Arc<dyn LanguageOracle>,
    timeouts: TimeoutManager,
    limits: Limits,
}

struct DecomposeState {
    session: DecompositionSession,
    /// Seed for the deterministic id counter
    next_id: u64,
}

impl DecompositionEngine {
    pub fn new(
        detector: Arc<AtomicityDetector>,
        oracle: Arc<dyn LanguageOracle>,
        timeouts: TimeoutManager,
        limits: Limits,
    ) -> Self {
        Self {
            detector,
            oracle,
            timeouts,
            limits,
        }
    }

    /// Decompose a root spec into a session. The whole run is capped by
    /// the decomposition timeout.
    pub async fn decompose(
        &self,
        root: TaskSpec,
        context: &ProjectContext,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<DecompositionSession> {
        root.validate()?;
        let session_timeout = None;
        self.timeouts
            .race(
                TimeoutKind::TaskDecomposition,
                self.decompose_inner(root, context, cancel),
                session_timeout,
            )
            .await
    }

    async fn decompose_inner(
        &self,
        root: TaskSpec,
        context: &ProjectContext,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<DecompositionSession> {
        let session_id = root.id;
        let mut state = DecomposeState {
            session: DecompositionSession::new(session_id, root.clone()),
            next_id: 0,
        };
        state.session.rich_results.total_generated = 1;

        self.split_node(root, 0, &mut state, context, cancel).await?;

        tracing::info!(
            session = %session_id,
            atomics = state.session.atomic_tasks.len(),
            warnings = state.session.rich_results.warnings.len(),
            "decomposition finished"
        );
        Ok(state.session)
    }

    /// Decompose one node; returns the atomic ids its subtree emitted.
    fn split_node<'a>(
        &'a self,
        spec: TaskSpec,
        depth: u32,
        state: &'a mut DecomposeState,
        context: &'a ProjectContext,
        cancel: &'a CancellationToken,
    ) -> futures::future::BoxFuture<'a, OrchestratorResult<Vec<Uuid>>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            if state.session.atomic_tasks.len() >= self.limits.max_tasks {
                let id = spec.id;
                state.session.warn(format!(
                    "task cap ({}) reached, '{}' emitted without atomicity check",
                    self.limits.max_tasks, spec.title
                ));
                state
                    .session
                    .push_atomic(AtomicTask::certify_by_cap(spec, "task cap reached"));
                return Ok(vec![id]);
            }

            let mut scoped_context = context.clone();
            scoped_context.existing_tasks = state
                .session
                .atomic_tasks
                .iter()
                .map(|t| t.spec.title.clone())
                .collect();

            let verdict = self.detector.evaluate(&spec, &scoped_context, cancel).await;
            for warning in &verdict.warnings {
                state.session.warn(warning.clone());
            }

            if verdict.is_atomic {
                let id = spec.id;
                let atomic = AtomicTask::certify(spec, verdict.confidence)?;
                state.session.push_atomic(atomic);
                return Ok(vec![id]);
            }

            if depth >= self.limits.max_depth {
                let id = spec.id;
                state.session.warn(format!(
                    "max depth ({}) reached, '{}' emitted as atomic",
                    self.limits.max_depth, spec.title
                ));
                state
                    .session
                    .push_atomic(AtomicTask::certify_by_cap(spec, "max depth reached"));
                return Ok(vec![id]);
            }

            let children = match self.ask_for_split(&spec, &scoped_context, depth, cancel).await {
                Ok(children) if !children.is_empty() => children,
                Ok(_) => {
                    let id = spec.id;
                    state
                        .session
                        .warn(format!("oracle returned no children for '{}'", spec.title));
                    state
                        .session
                        .push_atomic(AtomicTask::certify_by_cap(spec, "split produced no children"));
                    return Ok(vec![id]);
                }
                Err(err) => {
                    let id = spec.id;
                    state.session.warn(format!(
                        "split unavailable for '{}' ({}), emitted as-is",
                        spec.title,
                        err.kind()
                    ));
                    state
                        .session
                        .push_atomic(AtomicTask::certify_by_cap(spec, "split unavailable"));
                    return Ok(vec![id]);
                }
            };

            // Materialize child specs with deterministic ids, inheriting
            // the parent's project scope and timestamp.
            let mut child_specs: Vec<TaskSpec> = Vec::with_capacity(children.len());
            let mut sibling_deps: Vec<Vec<usize>> = Vec::with_capacity(children.len());
            for child in &children {
                let id = derive_task_id(state.session.id, state.next_id);
                state.next_id += 1;
                state.session.rich_results.total_generated += 1;

                let mut child_spec = TaskSpec {
                    id,
                    title: child.title.clone(),
                    description: if child.description.is_empty() {
                        child.title.clone()
                    } else {
                        child.description.clone()
                    },
                    priority: child
                        .priority
                        .as_deref()
                        .and_then(TaskPriority::parse_str)
                        .unwrap_or(spec.priority),
                    task_type: child
                        .task_type
                        .clone()
                        .unwrap_or_else(|| spec.task_type.clone()),
                    estimated_minutes: child.estimated_minutes,
                    depends_on: Vec::new(),
                    acceptance_criteria: child.acceptance_criteria.clone(),
                    file_paths: child.file_paths.clone(),
                    tags: spec.tags.clone(),
                    project_id: spec.project_id,
                    deadline: spec.deadline,
                    created_at: spec.created_at,
                };
                if child_spec.acceptance_criteria.is_empty() {
                    child_spec
                        .acceptance_criteria
                        .push(format!("{} is done", child_spec.title));
                }
                child_specs.push(child_spec);
                sibling_deps.push(
                    child
                        .depends_on
                        .iter()
                        .copied()
                        .filter(|&i| i < children.len())
                        .collect(),
                );
            }

            // Recurse per child, remembering which atomics each subtree
            // produced so sibling dependencies can be wired below.
            let mut subtree_atomics: Vec<Vec<Uuid>> = Vec::with_capacity(child_specs.len());
            for child_spec in child_specs {
                let emitted = self
                    .split_node(child_spec, depth + 1, state, context, cancel)
                    .await?;
                subtree_atomics.push(emitted);
            }

            // Oracle-declared sibling order: everything produced by the
            // prerequisite subtree precedes everything in the dependent.
            for (child_idx, deps) in sibling_deps.iter().enumerate() {
                for &dep_idx in deps {
                    if dep_idx == child_idx {
                        continue;
                    }
                    for &from in &subtree_atomics[dep_idx] {
                        for &to in &subtree_atomics[child_idx] {
                            if let Err(err) = state.session.graph.add_edge(from, to) {
                                state.session.warn(format!(
                                    "dependency {from} -> {to} rejected: {err}"
                                ));
                            }
                        }
                    }
                }
            }

            Ok(subtree_atomics.into_iter().flatten().collect())
        })
    }

    async fn ask_for_split(
        &self,
        spec: &TaskSpec,
        context: &ProjectContext,
        depth: u32,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Vec<SplitChild>> {
        let prompt = self.build_split_prompt(spec, context, depth);
        let oracle = Arc::clone(&self.oracle);

        let outcome = self
            .timeouts
            .run(
                TimeoutKind::LlmRequest,
                move || {
                    let oracle = Arc::clone(&oracle);
                    let prompt = prompt.clone();
                    async move { oracle.ask(&prompt, OracleQueryKind::Split).await }
                },
                RunOverrides::default(),
                cancel,
            )
            .await;

        let text = outcome.into_value()?;
        let json = extract_json_from_response(&text);
        let reply: SplitReply = serde_json::from_str(&json)
            .map_err(|e| OrchestratorError::Oracle(format!("unparseable split reply: {e}")))?;
        Ok(reply.tasks)
    }

    fn build_split_prompt(&self, spec: &TaskSpec, context: &ProjectContext, depth: u32) -> String {
        let produced = if context.existing_tasks.is_empty() {
            "None yet".to_string()
        } else {
            context
                .existing_tasks
                .iter()
                .map(|t| format!("- {t}"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            r#"You decompose development tasks for an orchestration runtime.
Split the task below into 2-6 smaller subtasks. Each subtask must be a
step toward the parent, with a single acceptance criterion, at most two
file paths, and an honest minute estimate.

## Parent Task (depth {})
Title: {}
Description: {}
Priority: {}
Estimated minutes: {}

## Project
Languages: {}
Frameworks: {}

## Already Produced
{}

## Required Output Format (JSON)
```json
{{
  "tasks": [
    {{
      "title": "Short subtask title",
      "description": "What to do",
      "priority": "low|medium|high|critical",
      "taskType": "standard",
      "estimatedMinutes": 10,
      "filePaths": ["src/file.rs"],
      "acceptanceCriteria": ["single criterion"],
      "dependsOn": [0]
    }}
  ]
}}
```
`dependsOn` holds zero-based indices of earlier subtasks in this reply.

IMPORTANT: Output ONLY the JSON object, no other text."#,
            depth,
            spec.title,
            spec.description,
            spec.priority.as_str(),
            spec.estimated_minutes,
            context.languages.join(", "),
            context.frameworks.join(", "),
            produced,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::NlpMethod;
    use crate::domain::ports::oracle::ScriptedOracle;

    fn engine_with(oracle: ScriptedOracle, limits: Limits) -> DecompositionEngine {
        let oracle = Arc::new(oracle);
        let detector = Arc::new(AtomicityDetector::new(
            Arc::clone(&oracle) as Arc<dyn LanguageOracle>,
            TimeoutManager::new(),
            NlpMethod::Hybrid,
            0.3,
        ));
        DecompositionEngine::new(
            detector,
            oracle,
            TimeoutManager::new(),
            limits,
        )
    }

    fn atomic_reply(confidence: f64) -> String {
        format!(r#"{{"isAtomic": true, "confidence": {confidence}, "reasoning": "small"}}"#)
    }

    fn root_spec() -> TaskSpec {
        TaskSpec::new("Add email input field", "Single input in LoginForm")
            .with_estimate(6.0)
            .with_file_path("src/LoginForm.tsx")
            .with_criterion("field renders with type=email")
    }

    #[tokio::test]
    async fn test_atomic_root_short_circuits() {
        let oracle = ScriptedOracle::with_replies(vec![atomic_reply(0.85)]);
        let engine = engine_with(oracle, Limits::default());

        let session = engine
            .decompose(root_spec(), &ProjectContext::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.atomic_tasks.len(), 1);
        assert_eq!(session.graph.len(), 1);
        assert_eq!(session.graph.edge_count(), 0);
        assert_eq!(session.rich_results.successfully_persisted, 1);
        assert!(session.rich_results.warnings.is_empty());
        assert!((session.atomic_tasks[0].atomicity_confidence - 0.85).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_coordinator_root_splits_into_children() {
        // Root fails the coordinator rule without consuming an oracle
        // reply; the split proposes two children, each judged atomic.
        let split = r#"{"tasks": [
            {"title": "Create user input form", "estimatedMinutes": 7,
             "filePaths": ["x.ts"], "acceptanceCriteria": ["form exists"], "dependsOn": []},
            {"title": "Validate user input", "estimatedMinutes": 6,
             "filePaths": ["x.ts"], "acceptanceCriteria": ["invalid input rejected"], "dependsOn": [0]}
        ]}"#;
        let oracle = ScriptedOracle::with_replies(vec![
            split.to_string(),
            atomic_reply(0.9),
            atomic_reply(0.8),
        ]);
        let engine = engine_with(oracle, Limits::default());

        let root = TaskSpec::new("Create and validate user input", "both steps")
            .with_estimate(7.0)
            .with_file_path("x.ts")
            .with_criterion("works");
        let session = engine
            .decompose(root, &ProjectContext::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.atomic_tasks.len(), 2);
        assert_eq!(session.graph.edge_count(), 1);
        let first = session.atomic_tasks[0].id();
        let second = session.atomic_tasks[1].id();
        assert!(session.graph.dependents_of(first).unwrap().contains(&second));
        assert_eq!(session.rich_results.total_generated, 3);
    }

    #[tokio::test]
    async fn test_max_depth_caps_branch_with_warning() {
        // Every node is judged non-atomic and every split returns one
        // child, driving the branch straight down to the depth cap.
        let non_atomic = r#"{"isAtomic": false, "confidence": 0.9, "reasoning": "too big"}"#;
        let split = r#"{"tasks": [
            {"title": "Still big subtask", "estimatedMinutes": 15,
             "filePaths": ["a.rs"], "acceptanceCriteria": ["works"], "dependsOn": []}
        ]}"#;
        let limits = Limits {
            max_depth: 2,
            ..Limits::default()
        };
        let oracle = ScriptedOracle::with_replies(vec![
            non_atomic.to_string(), // root verdict
            split.to_string(),      // root split
            non_atomic.to_string(), // depth-1 verdict
            split.to_string(),      // depth-1 split
            non_atomic.to_string(), // depth-2 verdict -> cap
        ]);
        let engine = engine_with(oracle, limits);

        let session = engine
            .decompose(root_spec(), &ProjectContext::default(), &CancellationToken::new())
            .await
            .unwrap();

        // No loss of tasks: the capped leaf is still emitted.
        assert_eq!(session.atomic_tasks.len(), 1);
        let leaf = &session.atomic_tasks[0];
        assert_eq!(leaf.cap_warning.as_deref(), Some("max depth reached"));
        assert!(session
            .rich_results
            .warnings
            .iter()
            .any(|w| w.contains("max depth")));
    }

    #[tokio::test]
    async fn test_task_cap_stops_further_splits() {
        let non_atomic = r#"{"isAtomic": false, "confidence": 0.9, "reasoning": "big"}"#;
        let split = r#"{"tasks": [
            {"title": "Left part", "estimatedMinutes": 5,
             "filePaths": ["l.rs"], "acceptanceCriteria": ["left ok"], "dependsOn": []},
            {"title": "Right part", "estimatedMinutes": 5,
             "filePaths": ["r.rs"], "acceptanceCriteria": ["right ok"], "dependsOn": []}
        ]}"#;
        let limits = Limits {
            max_tasks: 1,
            ..Limits::default()
        };
        // Root is split; the first child is atomic (fills the cap), the
        // second hits the cap and is emitted without an oracle call.
        let oracle = ScriptedOracle::with_replies(vec![
            non_atomic.to_string(),
            split.to_string(),
            atomic_reply(0.9),
        ]);
        let engine = engine_with(oracle, limits);

        let session = engine
            .decompose(root_spec(), &ProjectContext::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.atomic_tasks.len(), 2);
        assert!(session
            .rich_results
            .warnings
            .iter()
            .any(|w| w.contains("task cap")));
    }

    #[tokio::test]
    async fn test_split_failure_emits_node_as_is() {
        let non_atomic = r#"{"isAtomic": false, "confidence": 0.8, "reasoning": "big"}"#;
        let oracle = ScriptedOracle::new(vec![
            Ok(non_atomic.to_string()),
            Err(OrchestratorError::Validation("oracle refused".into())),
        ]);
        let engine = engine_with(oracle, Limits::default());

        let session = engine
            .decompose(root_spec(), &ProjectContext::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.atomic_tasks.len(), 1);
        assert_eq!(
            session.atomic_tasks[0].cap_warning.as_deref(),
            Some("split unavailable")
        );
    }

    #[tokio::test]
    async fn test_replay_is_byte_identical() {
        let replies = || {
            vec![
                r#"{"isAtomic": false, "confidence": 0.9, "reasoning": "big"}"#.to_string(),
                r#"{"tasks": [
                    {"title": "Part one", "estimatedMinutes": 5,
                     "filePaths": ["a.rs"], "acceptanceCriteria": ["one done"], "dependsOn": []},
                    {"title": "Part two", "estimatedMinutes": 5,
                     "filePaths": ["b.rs"], "acceptanceCriteria": ["two done"], "dependsOn": [0]}
                ]}"#
                .to_string(),
                atomic_reply(0.9),
                atomic_reply(0.9),
            ]
        };

        let root = root_spec();
        let ctx = ProjectContext::default();

        let engine_a = engine_with(ScriptedOracle::with_replies(replies()), Limits::default());
        let session_a = engine_a
            .decompose(root.clone(), &ctx, &CancellationToken::new())
            .await
            .unwrap();

        let engine_b = engine_with(ScriptedOracle::with_replies(replies()), Limits::default());
        let session_b = engine_b
            .decompose(root, &ctx, &CancellationToken::new())
            .await
            .unwrap();

        let bytes_a = serde_json::to_vec(&session_a).unwrap();
        let bytes_b = serde_json::to_vec(&session_b).unwrap();
        assert_eq!(bytes_a, bytes_b);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_decomposition() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let oracle = ScriptedOracle::with_replies(vec![]);
        let engine = engine_with(oracle, Limits::default());
        let err = engine
            .decompose(root_spec(), &ProjectContext::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }
}
