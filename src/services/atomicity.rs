//! Atomicity detection: is a task small enough to execute as-is?
//!
//! A deterministic rule layer runs first and is authoritative: any
//! failed rule forces a non-atomic verdict with zero confidence. Only
//! specs that pass every rule are worth an oracle round-trip. Oracle
//! verdicts are normalized (confidence clamped, low-confidence verdicts
//! demoted); an unreachable or unparseable oracle produces a fallback
//! verdict and a warning, never a failure.

use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::domain::models::config::{NlpMethod, TimeoutKind};
use crate::domain::models::task::{
    has_coordinating_conjunction, TaskSpec, ATOMIC_MAX_FILE_PATHS, ATOMIC_MAX_MINUTES,
};
use crate::domain::ports::oracle::{LanguageOracle, OracleQueryKind};
use crate::services::extract_json_from_response;
use crate::services::timeout::{RunOverrides, TimeoutManager};

/// Confidence reported by the fallback verdict when the oracle is
/// unavailable. Deliberately distinct from the 0.0 of a rule failure:
/// it records uncertainty, not a rule violation.
const FALLBACK_CONFIDENCE: f64 = 0.4;

/// Project-level context included in oracle prompts.
#[derive(Debug, Clone, Default)]
pub struct ProjectContext {
    pub languages: Vec<String>,
    pub frameworks: Vec<String>,
    /// Rough file count of the codebase
    pub codebase_size: usize,
    /// Titles of sibling tasks already produced
    pub existing_tasks: Vec<String>,
}

/// The detector's answer for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomicityVerdict {
    pub is_atomic: bool,
    pub confidence: f64,
    pub reasoning: String,
    pub estimated_minutes: f64,
    pub complexity_factors: Vec<String>,
    pub recommendations: Vec<String>,
    /// Non-fatal conditions hit while producing the verdict
    pub warnings: Vec<String>,
}

impl AtomicityVerdict {
    fn rule_failure(reason: &str, spec: &TaskSpec, factor: &str) -> Self {
        Self {
            is_atomic: false,
            confidence: 0.0,
            reasoning: reason.to_string(),
            estimated_minutes: spec.estimated_minutes,
            complexity_factors: vec![factor.to_string()],
            recommendations: vec!["split into smaller tasks".to_string()],
            warnings: Vec::new(),
        }
    }

    fn fallback(spec: &TaskSpec) -> Self {
        Self {
            is_atomic: false,
            confidence: FALLBACK_CONFIDENCE,
            reasoning: "oracle unavailable".to_string(),
            estimated_minutes: spec.estimated_minutes,
            complexity_factors: Vec::new(),
            recommendations: Vec::new(),
            warnings: vec!["oracle unavailable, used fallback".to_string()],
        }
    }
}

/// Raw shape of the oracle's JSON reply. Tolerant: unknown fields are
/// ignored and every field has a default.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OracleReply {
    #[serde(default)]
    is_atomic: bool,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    estimated_minutes: f64,
    #[serde(default)]
    complexity_factors: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
}

/// Classifies candidate tasks as atomic or needing a split.
pub struct AtomicityDetector {
    oracle: Arc<dyn LanguageOracle>,
    timeouts: TimeoutManager,
    method: NlpMethod,
    min_confidence: f64,
}

impl AtomicityDetector {
    pub fn new(
        oracle: Arc<dyn LanguageOracle>,
        timeouts: TimeoutManager,
        method: NlpMethod,
        min_confidence: f64,
    ) -> Self {
        Self {
            oracle,
            timeouts,
            method,
            min_confidence,
        }
    }

    /// Evaluate one spec. Infallible by design: oracle trouble degrades
    /// to the fallback verdict instead of erroring.
    pub async fn evaluate(
        &self,
        spec: &TaskSpec,
        context: &ProjectContext,
        cancel: &CancellationToken,
    ) -> AtomicityVerdict {
        if let Some(verdict) = self.deterministic_verdict(spec) {
            return verdict;
        }

        match self.method {
            NlpMethod::RulesOnly => AtomicityVerdict {
                is_atomic: true,
                confidence: 0.8,
                reasoning: "deterministic rules passed".to_string(),
                estimated_minutes: spec.estimated_minutes,
                complexity_factors: Vec::new(),
                recommendations: Vec::new(),
                warnings: Vec::new(),
            },
            NlpMethod::Hybrid | NlpMethod::OracleOnly => {
                self.oracle_verdict(spec, context, cancel).await
            }
        }
    }

    /// The deterministic rule layer. Returns a forced non-atomic
    /// verdict when any rule fails, `None` when all pass.
    fn deterministic_verdict(&self, spec: &TaskSpec) -> Option<AtomicityVerdict> {
        if spec.estimated_minutes > ATOMIC_MAX_MINUTES {
            return Some(AtomicityVerdict::rule_failure(
                "exceeds duration threshold",
                spec,
                "duration",
            ));
        }
        if spec.file_paths.len() > ATOMIC_MAX_FILE_PATHS {
            return Some(AtomicityVerdict::rule_failure(
                "multi-file change",
                spec,
                "file_count",
            ));
        }
        if spec.acceptance_criteria.len() != 1 {
            return Some(AtomicityVerdict::rule_failure(
                "must have exactly one acceptance criterion",
                spec,
                "acceptance_criteria",
            ));
        }
        // OracleOnly keeps the hard bounds above but delegates the
        // language-level judgment to the oracle.
        if self.method != NlpMethod::OracleOnly
            && (has_coordinating_conjunction(&spec.title)
                || has_coordinating_conjunction(&spec.description))
        {
            return Some(AtomicityVerdict::rule_failure(
                "multiple actions",
                spec,
                "coordinating_conjunction",
            ));
        }
        None
    }

    async fn oracle_verdict(
        &self,
        spec: &TaskSpec,
        context: &ProjectContext,
        cancel: &CancellationToken,
    ) -> AtomicityVerdict {
        let prompt = self.build_prompt(spec, context);
        let oracle = Arc::clone(&self.oracle);

        let outcome = self
            .timeouts
            .run(
                TimeoutKind::LlmRequest,
                move || {
                    let oracle = Arc::clone(&oracle);
                    let prompt = prompt.clone();
                    async move { oracle.ask(&prompt, OracleQueryKind::Atomicity).await }
                },
                RunOverrides::default(),
                cancel,
            )
            .await;

        let text = match outcome.into_value() {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(error = %err, task = %spec.id, "atomicity oracle call failed");
                return AtomicityVerdict::fallback(spec);
            }
        };

        let json = extract_json_from_response(&text);
        match serde_json::from_str::<OracleReply>(&json) {
            Ok(reply) => self.normalize(reply, spec),
            Err(err) => {
                tracing::warn!(error = %err, task = %spec.id, "atomicity oracle reply unparseable");
                AtomicityVerdict::fallback(spec)
            }
        }
    }

    /// Clamp and threshold an oracle reply. A normalized non-atomic
    /// verdict always carries confidence 0.0.
    fn normalize(&self, reply: OracleReply, spec: &TaskSpec) -> AtomicityVerdict {
        let clamped = reply.confidence.clamp(0.0, 1.0);
        let is_atomic = reply.is_atomic && clamped >= self.min_confidence;
        let confidence = if is_atomic { clamped } else { 0.0 };

        AtomicityVerdict {
            is_atomic,
            confidence,
            reasoning: reply.reasoning,
            estimated_minutes: if reply.estimated_minutes > 0.0 {
                reply.estimated_minutes
            } else {
                spec.estimated_minutes
            },
            complexity_factors: reply.complexity_factors,
            recommendations: reply.recommendations,
            warnings: Vec::new(),
        }
    }

    fn build_prompt(&self, spec: &TaskSpec, context: &ProjectContext) -> String {
        let criteria = spec
            .acceptance_criteria
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n");
        let siblings = if context.existing_tasks.is_empty() {
            "None yet".to_string()
        } else {
            context.existing_tasks.join(", ")
        };

        format!(
            r#"You judge whether a development task is atomic: executable by one
agent in one sitting, touching at most two files, with a single
acceptance criterion.

## Task
Title: {}
Description: {}
Estimated minutes: {}
File paths: {}
Acceptance criteria:
{}

## Project
Languages: {}
Frameworks: {}
Codebase size: ~{} files
Sibling tasks: {}

## Required Output Format (JSON)
```json
{{
  "isAtomic": true,
  "confidence": 0.0,
  "reasoning": "one short sentence",
  "estimatedMinutes": 0,
  "complexityFactors": ["factor"],
  "recommendations": ["recommendation"]
}}
```

IMPORTANT: Output ONLY the JSON object, no other text."#,
            spec.title,
            spec.description,
            spec.estimated_minutes,
            spec.file_paths.join(", "),
            criteria,
            context.languages.join(", "),
            context.frameworks.join(", "),
            context.codebase_size,
            siblings,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::OrchestratorError;
    use crate::domain::ports::oracle::ScriptedOracle;

    fn detector(oracle: ScriptedOracle, method: NlpMethod) -> AtomicityDetector {
        AtomicityDetector::new(Arc::new(oracle), TimeoutManager::new(), method, 0.3)
    }

    fn atomic_spec() -> TaskSpec {
        TaskSpec::new(
            "Add email input field",
            "Single input type=email in the login form with required attribute",
        )
        .with_estimate(6.0)
        .with_file_path("src/LoginForm.tsx")
        .with_criterion("field renders with type=email")
    }

    #[tokio::test]
    async fn test_clean_spec_reaches_oracle_and_passes() {
        let oracle = ScriptedOracle::with_replies(vec![
            r#"{"isAtomic": true, "confidence": 0.85, "reasoning": "single field", "estimatedMinutes": 6}"#.to_string(),
        ]);
        let d = detector(oracle, NlpMethod::Hybrid);
        let verdict = d
            .evaluate(&atomic_spec(), &ProjectContext::default(), &CancellationToken::new())
            .await;
        assert!(verdict.is_atomic);
        assert!((verdict.confidence - 0.85).abs() < f64::EPSILON);
        assert!(verdict.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_coordinator_title_short_circuits_oracle() {
        let oracle = ScriptedOracle::with_replies(vec![]);
        let d = detector(oracle, NlpMethod::Hybrid);
        let spec = TaskSpec::new("Create and validate user input", "do both things")
            .with_estimate(7.0)
            .with_file_path("x.ts")
            .with_criterion("works");
        let verdict = d
            .evaluate(&spec, &ProjectContext::default(), &CancellationToken::new())
            .await;
        assert!(!verdict.is_atomic);
        assert!((verdict.confidence - 0.0).abs() < f64::EPSILON);
        assert_eq!(verdict.reasoning, "multiple actions");
    }

    #[tokio::test]
    async fn test_duration_rule() {
        let oracle = ScriptedOracle::with_replies(vec![]);
        let d = detector(oracle, NlpMethod::Hybrid);
        let spec = atomic_spec().with_estimate(25.0);
        let verdict = d
            .evaluate(&spec, &ProjectContext::default(), &CancellationToken::new())
            .await;
        assert!(!verdict.is_atomic);
        assert_eq!(verdict.reasoning, "exceeds duration threshold");
    }

    #[tokio::test]
    async fn test_file_count_rule() {
        let oracle = ScriptedOracle::with_replies(vec![]);
        let d = detector(oracle, NlpMethod::Hybrid);
        let spec = atomic_spec()
            .with_file_path("a.rs")
            .with_file_path("b.rs");
        let verdict = d
            .evaluate(&spec, &ProjectContext::default(), &CancellationToken::new())
            .await;
        assert_eq!(verdict.reasoning, "multi-file change");
    }

    #[tokio::test]
    async fn test_criteria_rule() {
        let oracle = ScriptedOracle::with_replies(vec![]);
        let d = detector(oracle, NlpMethod::Hybrid);
        let spec = atomic_spec().with_criterion("a second criterion");
        let verdict = d
            .evaluate(&spec, &ProjectContext::default(), &CancellationToken::new())
            .await;
        assert_eq!(verdict.reasoning, "must have exactly one acceptance criterion");
    }

    #[tokio::test]
    async fn test_low_confidence_demotes_verdict() {
        let oracle = ScriptedOracle::with_replies(vec![
            r#"{"isAtomic": true, "confidence": 0.2, "reasoning": "unsure"}"#.to_string(),
        ]);
        let d = detector(oracle, NlpMethod::Hybrid);
        let verdict = d
            .evaluate(&atomic_spec(), &ProjectContext::default(), &CancellationToken::new())
            .await;
        assert!(!verdict.is_atomic);
        assert!((verdict.confidence - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_confidence_clamped() {
        let oracle = ScriptedOracle::with_replies(vec![
            r#"{"isAtomic": true, "confidence": 3.5, "reasoning": "overeager"}"#.to_string(),
        ]);
        let d = detector(oracle, NlpMethod::Hybrid);
        let verdict = d
            .evaluate(&atomic_spec(), &ProjectContext::default(), &CancellationToken::new())
            .await;
        assert!(verdict.is_atomic);
        assert!((verdict.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_oracle_failure_yields_fallback() {
        let oracle = ScriptedOracle::new(vec![
            Err(OrchestratorError::Validation("provider gone".into())),
        ]);
        let d = detector(oracle, NlpMethod::Hybrid);
        let verdict = d
            .evaluate(&atomic_spec(), &ProjectContext::default(), &CancellationToken::new())
            .await;
        assert!(!verdict.is_atomic);
        assert!((verdict.confidence - FALLBACK_CONFIDENCE).abs() < f64::EPSILON);
        assert_eq!(verdict.reasoning, "oracle unavailable");
        assert_eq!(verdict.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_reply_yields_fallback() {
        let oracle =
            ScriptedOracle::with_replies(vec!["I think it depends on many things.".to_string()]);
        let d = detector(oracle, NlpMethod::Hybrid);
        let verdict = d
            .evaluate(&atomic_spec(), &ProjectContext::default(), &CancellationToken::new())
            .await;
        assert_eq!(verdict.reasoning, "oracle unavailable");
    }

    #[tokio::test]
    async fn test_code_fenced_reply_is_parsed() {
        let oracle = ScriptedOracle::with_replies(vec![
            "```json\n{\"isAtomic\": true, \"confidence\": 0.9}\n```".to_string(),
        ]);
        let d = detector(oracle, NlpMethod::Hybrid);
        let verdict = d
            .evaluate(&atomic_spec(), &ProjectContext::default(), &CancellationToken::new())
            .await;
        assert!(verdict.is_atomic);
    }

    #[tokio::test]
    async fn test_rules_only_never_asks_oracle() {
        let oracle = ScriptedOracle::with_replies(vec![]);
        let d = detector(oracle, NlpMethod::RulesOnly);
        let verdict = d
            .evaluate(&atomic_spec(), &ProjectContext::default(), &CancellationToken::new())
            .await;
        assert!(verdict.is_atomic);
        assert_eq!(verdict.reasoning, "deterministic rules passed");
    }

    #[tokio::test]
    async fn test_oracle_only_skips_coordinator_rule() {
        let oracle = ScriptedOracle::with_replies(vec![
            r#"{"isAtomic": true, "confidence": 0.7, "reasoning": "idiomatic pair"}"#.to_string(),
        ]);
        let d = detector(oracle, NlpMethod::OracleOnly);
        let spec = TaskSpec::new("Read and log the header", "one call site")
            .with_estimate(5.0)
            .with_file_path("src/io.rs")
            .with_criterion("header logged");
        let verdict = d
            .evaluate(&spec, &ProjectContext::default(), &CancellationToken::new())
            .await;
        assert!(verdict.is_atomic);
    }
}
