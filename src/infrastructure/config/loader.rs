//! Configuration loader with hierarchical merging.
//!
//! Precedence (lowest to highest): compiled defaults, project config,
//! project local overrides, `VIBE_*` environment variables. The
//! documented flat variable names (`VIBE_MAX_RETRIES`, ...) are mapped
//! onto their nested fields; everything else follows the
//! `VIBE_SECTION__FIELD` convention.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::config::Config;

/// Bounds the loader enforces after extraction.
const TASK_EXECUTION_SECS: (u64, u64) = (10, 3_600);
const MAX_RETRIES: (u32, u32) = (0, 10);
const BACKOFF_MULTIPLIER: (f64, f64) = (1.0, 5.0);
const INITIAL_DELAY_MS: (u64, u64) = (100, 10_000);
const MAX_DELAY_MS_CEILING: u64 = 300_000;
const RETENTION_FLOOR_HOURS: u64 = 24;

/// Configuration loader.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    pub fn load() -> Result<Config> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".vibeflow/config.yaml"))
            .merge(Yaml::file(".vibeflow/local.yaml"))
            .merge(Self::env_provider())
            .extract()
            .context("Failed to extract configuration")?;

        Self::normalize(&mut config);
        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file (plus env overrides).
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Self::env_provider())
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::normalize(&mut config);
        Self::validate(&config)?;
        Ok(config)
    }

    /// `VIBE_*` environment provider with the flat aliases mapped onto
    /// nested fields.
    fn env_provider() -> Env {
        Env::prefixed("VIBE_").map(|key| {
            let flat = key.as_str().to_ascii_uppercase();
            let mapped = match flat.as_str() {
                "MAX_CONCURRENT_TASKS" => "limits.max_concurrent_tasks".to_string(),
                "TASK_EXECUTION_TIMEOUT" => "timeouts.task_execution_secs".to_string(),
                "TASK_DECOMPOSITION_TIMEOUT" => "timeouts.task_decomposition_secs".to_string(),
                "LLM_REQUEST_TIMEOUT" => "timeouts.llm_request_secs".to_string(),
                "MAX_RETRIES" => "retry.max_retries".to_string(),
                "BACKOFF_MULTIPLIER" => "retry.backoff_multiplier".to_string(),
                "INITIAL_DELAY_MS" => "retry.initial_delay_ms".to_string(),
                "MAX_DELAY_MS" => "retry.max_delay_ms".to_string(),
                "MIN_CONFIDENCE" => "limits.min_confidence".to_string(),
                "PRIMARY_NLP_METHOD" => "oracle.primary_nlp_method".to_string(),
                other => other.replace("__", ".").to_lowercase(),
            };
            mapped.into()
        })
    }

    /// Repairs that are policy, not user error: an empty transport list
    /// gets the default set, retention is clamped to its floor.
    fn normalize(config: &mut Config) {
        if config.transports.is_empty() {
            config.transports = Config::default_transports();
        }
        if config.persistence.retention_hours < RETENTION_FLOOR_HOURS {
            tracing::warn!(
                requested = config.persistence.retention_hours,
                floor = RETENTION_FLOOR_HOURS,
                "retention_hours below floor, clamping"
            );
            config.persistence.retention_hours = RETENTION_FLOOR_HOURS;
        }
    }

    /// Validate a configuration against the sanity bounds.
    pub fn validate(config: &Config) -> OrchestratorResult<()> {
        let t = config.timeouts.task_execution_secs;
        if !(TASK_EXECUTION_SECS.0..=TASK_EXECUTION_SECS.1).contains(&t) {
            return Err(config_error(
                "timeouts.task_execution_secs",
                format!("{}..={} seconds", TASK_EXECUTION_SECS.0, TASK_EXECUTION_SECS.1),
                t,
            ));
        }

        let r = &config.retry;
        if !(MAX_RETRIES.0..=MAX_RETRIES.1).contains(&r.max_retries) {
            return Err(config_error(
                "retry.max_retries",
                format!("{}..={}", MAX_RETRIES.0, MAX_RETRIES.1),
                r.max_retries,
            ));
        }
        if !(BACKOFF_MULTIPLIER.0..=BACKOFF_MULTIPLIER.1).contains(&r.backoff_multiplier) {
            return Err(config_error(
                "retry.backoff_multiplier",
                format!("{}..={}", BACKOFF_MULTIPLIER.0, BACKOFF_MULTIPLIER.1),
                r.backoff_multiplier,
            ));
        }
        if !(INITIAL_DELAY_MS.0..=INITIAL_DELAY_MS.1).contains(&r.initial_delay_ms) {
            return Err(config_error(
                "retry.initial_delay_ms",
                format!("{}..={} ms", INITIAL_DELAY_MS.0, INITIAL_DELAY_MS.1),
                r.initial_delay_ms,
            ));
        }
        if r.max_delay_ms > MAX_DELAY_MS_CEILING {
            return Err(config_error(
                "retry.max_delay_ms",
                format!("<= {MAX_DELAY_MS_CEILING} ms"),
                r.max_delay_ms,
            ));
        }
        if r.max_delay_ms < r.initial_delay_ms {
            return Err(config_error(
                "retry.max_delay_ms",
                format!(">= initial_delay_ms ({})", r.initial_delay_ms),
                r.max_delay_ms,
            ));
        }

        let l = &config.limits;
        if l.max_concurrent_tasks == 0 || l.max_concurrent_tasks > 100 {
            return Err(config_error(
                "limits.max_concurrent_tasks",
                "1..=100",
                l.max_concurrent_tasks,
            ));
        }
        if l.max_depth == 0 {
            return Err(config_error("limits.max_depth", ">= 1", l.max_depth));
        }
        if l.max_tasks == 0 {
            return Err(config_error("limits.max_tasks", ">= 1", l.max_tasks));
        }
        if !(0.0..=1.0).contains(&l.min_confidence) {
            return Err(config_error(
                "limits.min_confidence",
                "0.0..=1.0",
                l.min_confidence,
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(config_error(
                "logging.level",
                "one of trace|debug|info|warn|error",
                &config.logging.level,
            ));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            return Err(config_error(
                "logging.format",
                "one of json|pretty",
                &config.logging.format,
            ));
        }

        for family in [
            ("rate_limits.general", &config.rate_limits.general),
            ("rate_limits.api", &config.rate_limits.api),
            ("rate_limits.upload", &config.rate_limits.upload),
            ("rate_limits.task_start", &config.rate_limits.task_start),
        ] {
            if family.1.window_ms == 0 {
                return Err(config_error(
                    &format!("{}.window_ms", family.0),
                    ">= 1",
                    family.1.window_ms,
                ));
            }
            if family.1.max_requests == 0 {
                return Err(config_error(
                    &format!("{}.max_requests", family.0),
                    ">= 1",
                    family.1.max_requests,
                ));
            }
        }

        Ok(())
    }
}

fn config_error(key: &str, expected: impl ToString, provided: impl ToString) -> OrchestratorError {
    OrchestratorError::Config {
        key: key.to_string(),
        expected: expected.to_string(),
        provided: provided.to_string(),
    }
}
