//! Language-oracle port.
//!
//! The runtime never imports a specific model provider; everything it
//! needs from the upstream model flows through this trait. Prompt
//! engineering lives with the components that own the prompts.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};

/// What kind of question is being asked; implementations may route
/// kinds to different models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OracleQueryKind {
    /// "Is this task atomic?"
    Atomicity,
    /// "Split this task into children."
    Split,
}

impl OracleQueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Atomicity => "atomicity",
            Self::Split => "split",
        }
    }
}

/// An opaque text-producing collaborator.
#[async_trait]
pub trait LanguageOracle: Send + Sync {
    /// Ask the oracle a question, returning raw text. The caller owns
    /// parsing and normalization of the reply.
    async fn ask(&self, prompt: &str, kind: OracleQueryKind) -> OrchestratorResult<String>;
}

/// Deterministic oracle for tests and replays: answers are popped from
/// a scripted queue in order.
#[derive(Default)]
pub struct ScriptedOracle {
    responses: Mutex<VecDeque<OrchestratorResult<String>>>,
    /// Prompts received, for assertion in tests
    prompts: Mutex<Vec<(OracleQueryKind, String)>>,
}

impl ScriptedOracle {
    pub fn new(responses: impl IntoIterator<Item = OrchestratorResult<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Script a sequence of successful text replies.
    pub fn with_replies(replies: impl IntoIterator<Item = String>) -> Self {
        Self::new(replies.into_iter().map(Ok))
    }

    /// Prompts the oracle has been asked so far.
    pub fn seen_prompts(&self) -> Vec<(OracleQueryKind, String)> {
        self.prompts.lock().expect("prompt lock poisoned").clone()
    }
}

#[async_trait]
impl LanguageOracle for ScriptedOracle {
    async fn ask(&self, prompt: &str, kind: OracleQueryKind) -> OrchestratorResult<String> {
        self.prompts
            .lock()
            .expect("prompt lock poisoned")
            .push((kind, prompt.to_string()));
        self.responses
            .lock()
            .expect("response lock poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                Err(OrchestratorError::Oracle(
                    "scripted oracle exhausted".to_string(),
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_oracle_pops_in_order() {
        let oracle = ScriptedOracle::with_replies(vec!["first".into(), "second".into()]);
        assert_eq!(
            oracle.ask("p1", OracleQueryKind::Atomicity).await.unwrap(),
            "first"
        );
        assert_eq!(
            oracle.ask("p2", OracleQueryKind::Split).await.unwrap(),
            "second"
        );
        assert!(oracle.ask("p3", OracleQueryKind::Split).await.is_err());

        let prompts = oracle.seen_prompts();
        assert_eq!(prompts.len(), 3);
        assert_eq!(prompts[0].0, OracleQueryKind::Atomicity);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let oracle = ScriptedOracle::new(vec![
            Err(OrchestratorError::Oracle("503".into())),
            Ok("recovered".into()),
        ]);
        assert!(oracle.ask("p", OracleQueryKind::Atomicity).await.is_err());
        assert_eq!(
            oracle.ask("p", OracleQueryKind::Atomicity).await.unwrap(),
            "recovered"
        );
    }
}
