//! Timeout and retry wrapper for async operations.
//!
//! Wraps any awaitable with the timeout budget of its operation kind
//! and retries transient failures with the configured backoff curve.
//! Non-retryable errors and cancellation short-circuit immediately.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::config::{RetryPolicy, TimeoutKind};
use crate::infrastructure::config::ConfigRegistry;

/// Outcome of a managed run: the value or final error plus the
/// bookkeeping callers use for diagnostics and invariant checks.
#[derive(Debug)]
pub struct RunOutcome<T> {
    pub value: OrchestratorResult<T>,
    /// Whether the final failure was a timeout
    pub timed_out: bool,
    /// Retries performed (not counting the first attempt)
    pub retry_count: u32,
    /// Wall time across all attempts and backoff delays
    pub elapsed: Duration,
}

impl<T> RunOutcome<T> {
    pub fn ok(&self) -> bool {
        self.value.is_ok()
    }

    pub fn into_value(self) -> OrchestratorResult<T> {
        self.value
    }
}

/// Per-call overrides for timeout and retry policy.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl RunOverrides {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            retry: None,
        }
    }
}

/// Wraps awaitables with timeout and retry policy from the registry.
#[derive(Debug, Clone)]
pub struct TimeoutManager {
    registry: ConfigRegistry,
}

impl Default for TimeoutManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutManager {
    pub fn new() -> Self {
        Self {
            registry: ConfigRegistry::get_instance(),
        }
    }

    pub fn with_registry(registry: ConfigRegistry) -> Self {
        Self { registry }
    }

    /// Run `operation` under the timeout for `kind`, retrying transient
    /// failures per policy. The factory is called once per attempt.
    pub async fn run<T, F, Fut>(
        &self,
        kind: TimeoutKind,
        mut operation: F,
        overrides: RunOverrides,
        cancel: &CancellationToken,
    ) -> RunOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OrchestratorResult<T>>,
    {
        let timeout = overrides
            .timeout
            .unwrap_or_else(|| self.registry.timeout(kind));
        let policy = overrides
            .retry
            .unwrap_or_else(|| self.registry.retry_policy());

        let started = Instant::now();
        let mut retry_count: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return RunOutcome {
                    value: Err(OrchestratorError::Cancelled),
                    timed_out: false,
                    retry_count,
                    elapsed: started.elapsed(),
                };
            }

            let attempt_started = Instant::now();
            let attempt_result: OrchestratorResult<T> = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(OrchestratorError::Cancelled),
                outcome = tokio::time::timeout(timeout, operation()) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(OrchestratorError::Timeout {
                        op: kind.as_str().to_string(),
                        elapsed_ms: attempt_started.elapsed().as_millis() as u64,
                        limit_ms: timeout.as_millis() as u64,
                    }),
                },
            };

            match attempt_result {
                Ok(value) => {
                    return RunOutcome {
                        value: Ok(value),
                        timed_out: false,
                        retry_count,
                        elapsed: started.elapsed(),
                    };
                }
                Err(err) => {
                    let timed_out = matches!(err, OrchestratorError::Timeout { .. });
                    let cancelled = matches!(err, OrchestratorError::Cancelled);

                    if cancelled || !err.is_retryable() || retry_count >= policy.max_retries {
                        tracing::debug!(
                            op = kind.as_str(),
                            retries = retry_count,
                            error = %err,
                            "giving up on managed operation"
                        );
                        return RunOutcome {
                            value: Err(err),
                            timed_out,
                            retry_count,
                            elapsed: started.elapsed(),
                        };
                    }

                    retry_count += 1;
                    let delay = policy.delay_for_attempt(retry_count);
                    tracing::debug!(
                        op = kind.as_str(),
                        attempt = retry_count,
                        max = policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );

                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            return RunOutcome {
                                value: Err(OrchestratorError::Cancelled),
                                timed_out: false,
                                retry_count,
                                elapsed: started.elapsed(),
                            };
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Race a future against the timeout for `kind`; no retries.
    pub async fn race<T>(
        &self,
        kind: TimeoutKind,
        future: impl Future<Output = OrchestratorResult<T>>,
        override_timeout: Option<Duration>,
    ) -> OrchestratorResult<T> {
        let timeout = override_timeout.unwrap_or_else(|| self.registry.timeout(kind));
        let started = Instant::now();
        match tokio::time::timeout(timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Timeout {
                op: kind.as_str().to_string(),
                elapsed_ms: started.elapsed().as_millis() as u64,
                limit_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::domain::models::config::BackoffStrategy;

    fn manager() -> TimeoutManager {
        // Fallback handle serves compiled defaults, which is all these
        // tests need; per-test policy comes through overrides.
        TimeoutManager::with_registry(ConfigRegistry::get_instance())
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_multiplier: 2.0,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            strategy: BackoffStrategy::Exponential,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let cancel = CancellationToken::new();
        let outcome = manager()
            .run(
                TimeoutKind::LlmRequest,
                || async { Ok(42) },
                RunOverrides::default(),
                &cancel,
            )
            .await;
        assert!(outcome.ok());
        assert_eq!(outcome.retry_count, 0);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.into_value().unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_success() {
        // Fails twice with a retryable error, then succeeds. With
        // multiplier 2 and initial 100ms the observed delays are
        // [100ms, 200ms], so total elapsed is at least 300ms.
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);

        let outcome = manager()
            .run(
                TimeoutKind::LlmRequest,
                move || {
                    let calls = Arc::clone(&calls_in);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(OrchestratorError::Oracle("upstream 503".into()))
                        } else {
                            Ok("done")
                        }
                    }
                },
                RunOverrides {
                    timeout: None,
                    retry: Some(fast_policy(3)),
                },
                &cancel,
            )
            .await;

        assert!(outcome.ok());
        assert_eq!(outcome.retry_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(outcome.elapsed >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);

        let outcome: RunOutcome<()> = manager()
            .run(
                TimeoutKind::LlmRequest,
                move || {
                    let calls = Arc::clone(&calls_in);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(OrchestratorError::Oracle("always failing".into()))
                    }
                },
                RunOverrides {
                    timeout: None,
                    retry: Some(fast_policy(2)),
                },
                &cancel,
            )
            .await;

        assert!(!outcome.ok());
        assert_eq!(outcome.retry_count, 2);
        // Initial attempt + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_short_circuits() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);

        let outcome: RunOutcome<()> = manager()
            .run(
                TimeoutKind::TaskExecution,
                move || {
                    let calls = Arc::clone(&calls_in);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(OrchestratorError::Validation("bad input".into()))
                    }
                },
                RunOverrides {
                    timeout: None,
                    retry: Some(fast_policy(5)),
                },
                &cancel,
            )
            .await;

        assert!(!outcome.ok());
        assert_eq!(outcome.retry_count, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_marks_outcome() {
        let cancel = CancellationToken::new();
        let outcome: RunOutcome<()> = manager()
            .run(
                TimeoutKind::LlmRequest,
                || async {
                    tokio::time::sleep(Duration::from_secs(3_600)).await;
                    Ok(())
                },
                RunOverrides {
                    timeout: Some(Duration::from_millis(50)),
                    retry: Some(RetryPolicy {
                        max_retries: 0,
                        ..fast_policy(0)
                    }),
                },
                &cancel,
            )
            .await;

        assert!(!outcome.ok());
        assert!(outcome.timed_out);
        assert_eq!(outcome.value.unwrap_err().kind(), "timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_retries() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let outcome: RunOutcome<()> = manager()
            .run(
                TimeoutKind::LlmRequest,
                move || {
                    let calls = Arc::clone(&calls_in);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(OrchestratorError::Oracle("irrelevant".into()))
                    }
                },
                RunOverrides::default(),
                &cancel,
            )
            .await;

        assert!(matches!(
            outcome.value,
            Err(OrchestratorError::Cancelled)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let cancel = CancellationToken::new();
        let cancel_in = cancel.clone();

        let mgr = manager();
        let outcome_fut = mgr.run(
            TimeoutKind::LlmRequest,
            move || {
                // Cancel while the manager sleeps between attempts.
                let cancel = cancel_in.clone();
                async move {
                    cancel.cancel();
                    Err::<(), _>(OrchestratorError::Oracle("transient".into()))
                }
            },
            RunOverrides {
                timeout: None,
                retry: Some(fast_policy(3)),
            },
            &cancel,
        );

        let outcome = outcome_fut.await;
        assert!(matches!(outcome.value, Err(OrchestratorError::Cancelled)));
        assert!(outcome.retry_count <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_times_out() {
        let result: OrchestratorResult<()> = manager()
            .race(
                TimeoutKind::AgentCommunication,
                async {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(())
                },
                Some(Duration::from_millis(10)),
            )
            .await;
        assert_eq!(result.unwrap_err().kind(), "timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_passes_value_through() {
        let result = manager()
            .race(TimeoutKind::AgentCommunication, async { Ok(7) }, None)
            .await;
        assert_eq!(result.unwrap(), 7);
    }
}
