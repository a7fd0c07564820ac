//! End-to-end decomposition scenarios: from a submitted spec through
//! the detector, the engine, and a scheduler plan.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use vibeflow::domain::models::config::{Limits, NlpMethod, SchedulerPolicy};
use vibeflow::domain::models::task::TaskSpec;
use vibeflow::domain::models::worker::Worker;
use vibeflow::domain::ports::oracle::{LanguageOracle, ScriptedOracle};
use vibeflow::services::atomicity::{AtomicityDetector, ProjectContext};
use vibeflow::services::decomposer::DecompositionEngine;
use vibeflow::services::scheduler::Scheduler;
use vibeflow::services::timeout::TimeoutManager;

fn engine(oracle: ScriptedOracle) -> DecompositionEngine {
    let oracle: Arc<dyn LanguageOracle> = Arc::new(oracle);
    let timeouts = TimeoutManager::new();
    let detector = Arc::new(AtomicityDetector::new(
        Arc::clone(&oracle),
        timeouts.clone(),
        NlpMethod::Hybrid,
        0.3,
    ));
    DecompositionEngine::new(detector, oracle, timeouts, Limits::default())
}

#[tokio::test]
async fn atomic_input_short_circuits_decomposition() {
    // "Add email input field": passes every deterministic rule, the
    // oracle confirms atomicity, and the whole pipeline produces a
    // one-node graph and a one-entry plan.
    let oracle = ScriptedOracle::with_replies(vec![
        r#"{"isAtomic": true, "confidence": 0.85, "reasoning": "single field"}"#.to_string(),
    ]);
    let engine = engine(oracle);

    let root = TaskSpec::new(
        "Add email input field",
        "Single <input type=email> in LoginForm.tsx with required attribute",
    )
    .with_estimate(6.0)
    .with_file_path("src/LoginForm.tsx")
    .with_criterion("field renders with type=email");

    let session = engine
        .decompose(root, &ProjectContext::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(session.atomic_tasks.len(), 1);
    assert_eq!(session.graph.len(), 1);
    assert_eq!(session.graph.edge_count(), 0);
    assert!((session.atomic_tasks[0].atomicity_confidence - 0.85).abs() < f64::EPSILON);

    let schedule = Scheduler::new(SchedulerPolicy::default())
        .plan(
            &session.atomic_tasks,
            &session.graph,
            &[Worker::new("w", Vec::new())],
            &HashSet::new(),
        )
        .unwrap();
    assert_eq!(schedule.assignments.len(), 1);
}

#[tokio::test]
async fn coordinator_title_triggers_split() {
    // "Create and validate user input" fails the deterministic
    // coordinator rule (no oracle round-trip for the verdict) and the
    // engine splits it into two or more children.
    let split = r#"{"tasks": [
        {"title": "Create user input form", "estimatedMinutes": 7,
         "filePaths": ["x.ts"], "acceptanceCriteria": ["form exists"], "dependsOn": []},
        {"title": "Validate user input values", "estimatedMinutes": 6,
         "filePaths": ["x.ts"], "acceptanceCriteria": ["invalid input rejected"], "dependsOn": [0]}
    ]}"#;
    let oracle = ScriptedOracle::with_replies(vec![
        split.to_string(),
        r#"{"isAtomic": true, "confidence": 0.9, "reasoning": "one form"}"#.to_string(),
        r#"{"isAtomic": true, "confidence": 0.8, "reasoning": "one validator"}"#.to_string(),
    ]);
    let engine = engine(oracle);

    let root = TaskSpec::new("Create and validate user input", "both halves of the feature")
        .with_estimate(7.0)
        .with_file_path("x.ts")
        .with_criterion("works");

    let session = engine
        .decompose(root, &ProjectContext::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(session.atomic_tasks.len() >= 2);
    assert_eq!(session.graph.edge_count(), 1);

    // Dependency respect carries into the plan.
    let schedule = Scheduler::new(SchedulerPolicy::default())
        .plan(
            &session.atomic_tasks,
            &session.graph,
            &[Worker::new("w", Vec::new())],
            &HashSet::new(),
        )
        .unwrap();
    for (from, to) in session.graph.edges() {
        assert!(schedule.start_order(from).unwrap() < schedule.start_order(to).unwrap());
    }
}

#[tokio::test]
async fn oracle_outage_degrades_without_losing_tasks() {
    // Detector falls back (non-atomic) and the split is also
    // unavailable: the node is emitted atomic-by-cap with warnings,
    // never dropped.
    let oracle = ScriptedOracle::new(vec![
        Err(vibeflow::OrchestratorError::Validation("offline".into())),
        Err(vibeflow::OrchestratorError::Validation("offline".into())),
    ]);
    let engine = engine(oracle);

    let root = TaskSpec::new("Refactor parser module", "make it readable")
        .with_estimate(12.0)
        .with_file_path("src/parser.rs")
        .with_criterion("tests still pass");

    let session = engine
        .decompose(root, &ProjectContext::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(session.atomic_tasks.len(), 1);
    assert!(session.atomic_tasks[0].cap_warning.is_some());
    assert!(session
        .rich_results
        .warnings
        .iter()
        .any(|w| w.contains("oracle unavailable")));
}
