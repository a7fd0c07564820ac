//! HTTP implementation of the language-oracle port.
//!
//! Talks to an Anthropic-style messages endpoint. The runtime core
//! never sees this type behind anything but the `LanguageOracle` trait;
//! swapping providers means swapping this file.

use async_trait::async_trait;
use serde_json::json;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::config::OracleConfig;
use crate::domain::ports::oracle::{LanguageOracle, OracleQueryKind};

/// Environment variable holding the API key.
const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Oracle client over an HTTP messages endpoint.
pub struct HttpOracle {
    config: OracleConfig,
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpOracle {
    pub fn new(config: OracleConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let api_key = std::env::var(API_KEY_ENV).ok();
        Self {
            config,
            client,
            api_key,
        }
    }

    /// Override the key (tests, alternative credential sources).
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

#[async_trait]
impl LanguageOracle for HttpOracle {
    async fn ask(&self, prompt: &str, kind: OracleQueryKind) -> OrchestratorResult<String> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "oracle API key missing: set {API_KEY_ENV} or configure a key"
            ))
        })?;

        let body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": [
                { "role": "user", "content": prompt }
            ]
        });

        tracing::debug!(kind = kind.as_str(), "oracle request");
        let response = self
            .client
            .post(&self.config.endpoint)
            .header("content-type", "application/json")
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| OrchestratorError::Oracle(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::Oracle(format!(
                "upstream returned {status}: {body}"
            )));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| OrchestratorError::Oracle(format!("unreadable response body: {e}")))?;

        let text = value["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|block| {
                        if block["type"].as_str() == Some("text") {
                            block["text"].as_str().map(String::from)
                        } else {
                            None
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(OrchestratorError::Oracle(
                "response contained no text content".to_string(),
            ));
        }

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle_for(server: &mockito::ServerGuard) -> HttpOracle {
        let config = OracleConfig {
            endpoint: server.url(),
            ..OracleConfig::default()
        };
        HttpOracle::new(config).with_api_key("test-key")
    }

    #[tokio::test]
    async fn test_extracts_text_blocks() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_header("x-api-key", "test-key")
            .with_status(200)
            .with_body(
                r#"{"content": [
                    {"type": "text", "text": "{\"isAtomic\": true}"},
                    {"type": "tool_use", "id": "x"}
                ]}"#,
            )
            .create_async()
            .await;

        let oracle = oracle_for(&server);
        let text = oracle
            .ask("judge this", OracleQueryKind::Atomicity)
            .await
            .unwrap();
        assert_eq!(text, "{\"isAtomic\": true}");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_upstream_error_is_oracle_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let oracle = oracle_for(&server);
        let err = oracle
            .ask("judge this", OracleQueryKind::Split)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "oracle");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_empty_content_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_body(r#"{"content": []}"#)
            .create_async()
            .await;

        let oracle = oracle_for(&server);
        assert!(oracle
            .ask("judge this", OracleQueryKind::Atomicity)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_without_request() {
        let config = OracleConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            ..OracleConfig::default()
        };
        let mut oracle = HttpOracle::new(config);
        oracle.api_key = None;
        let err = oracle
            .ask("judge this", OracleQueryKind::Atomicity)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
