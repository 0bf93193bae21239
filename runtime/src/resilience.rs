// Copyright 2026 Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Retry-with-backoff and timeout racing.
//!
//! Every attempt is raced against a timer (and optionally a cancellation
//! token) with `tokio::select!`. The losing future is dropped, which cancels
//! it at its next await point, so an abandoned attempt can never touch
//! shared state after its timer has fired.

use crate::error::{is_transient, AttemptError};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Backoff and per-attempt timeout policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Budget for a single attempt. `None` lets attempts run unbounded.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            multiplier: 2.0,
            attempt_timeout: Some(Duration::from_millis(30_000)),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after a failed `attempt` (counted from 1):
    /// `min(base * multiplier^(attempt-1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        if capped.is_finite() {
            Duration::from_millis(capped as u64)
        } else {
            self.max_delay
        }
    }
}

/// What `execute_with_retry` produced.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: std::result::Result<T, AttemptError>,
    /// Attempts actually started.
    pub attempts: u32,
    pub elapsed: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> std::result::Result<T, AttemptError> {
        self.result
    }
}

/// Race `fut` against an optional timer and an optional cancellation token.
pub async fn race<T, F>(
    fut: F,
    timeout: Option<Duration>,
    cancel: Option<&CancellationToken>,
) -> std::result::Result<T, AttemptError>
where
    F: Future<Output = Result<T>>,
{
    let timer = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancelled => Err(AttemptError::Cancelled),
        res = fut => res.map_err(AttemptError::Failed),
        _ = timer => Err(AttemptError::Timeout(timeout.unwrap_or_default())),
    }
}

/// Run `operation` until it succeeds, a permanent error occurs, an attempt
/// times out, or `config.max_attempts` is exhausted.
///
/// The closure receives the 1-based attempt number.
pub async fn execute_with_retry<T, F, Fut>(operation: F, config: &RetryConfig) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    run_with_retry(operation, config, None).await
}

/// [`execute_with_retry`] with a cancellation branch in every race and in
/// every backoff sleep.
pub async fn execute_with_retry_cancellable<T, F, Fut>(
    operation: F,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    run_with_retry(operation, config, Some(cancel)).await
}

async fn run_with_retry<T, F, Fut>(
    mut operation: F,
    config: &RetryConfig,
    cancel: Option<&CancellationToken>,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = race(operation(attempt), config.attempt_timeout, cancel).await;

        let err = match result {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    elapsed: start.elapsed(),
                }
            }
            Err(err) => err,
        };

        let retryable = match &err {
            AttemptError::Failed(inner) => is_transient(inner),
            AttemptError::Timeout(_) | AttemptError::Cancelled => false,
        };

        if !retryable || attempt >= max_attempts {
            if retryable {
                tracing::debug!("retry budget exhausted after {attempt} attempt(s): {err:#}");
            } else {
                tracing::debug!("attempt {attempt} failed terminally: {err:#}");
            }
            return RetryOutcome {
                result: Err(err),
                attempts: attempt,
                elapsed: start.elapsed(),
            };
        }

        let delay = config.delay_for_attempt(attempt);
        tracing::debug!(
            "attempt {attempt}/{max_attempts} failed ({err:#}); retrying in {}ms",
            delay.as_millis()
        );

        if let Some(token) = cancel {
            tokio::select! {
                _ = token.cancelled() => {
                    return RetryOutcome {
                        result: Err(AttemptError::Cancelled),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Try `operation` once per budget in `timeouts` (expected ascending).
/// Returns the first success, or the last error once every budget is spent.
pub async fn execute_with_progressive_timeout<T, F, Fut>(
    mut operation: F,
    timeouts: &[Duration],
) -> std::result::Result<T, AttemptError>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = AttemptError::Failed(anyhow::anyhow!("no timeout budgets supplied"));

    for (i, budget) in timeouts.iter().copied().enumerate() {
        match race(operation(budget), Some(budget), None).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::debug!(
                    "progressive attempt {}/{} with {}ms budget failed: {err:#}",
                    i + 1,
                    timeouts.len(),
                    budget.as_millis()
                );
                last_err = err;
            }
        }
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SurfaceError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            attempt_timeout: Some(Duration::from_millis(500)),
        }
    }

    #[test]
    fn test_backoff_is_non_decreasing_and_capped() {
        let cfg = fast_config(10);
        let delays: Vec<Duration> = (1..=12).map(|a| cfg.delay_for_attempt(a)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= cfg.max_delay));
        assert_eq!(*delays.last().unwrap(), cfg.max_delay);
    }

    #[test]
    fn test_backoff_survives_huge_attempt_numbers() {
        let cfg = fast_config(3);
        assert_eq!(cfg.delay_for_attempt(u32::MAX), cfg.max_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let outcome = execute_with_retry(
            move |attempt| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        anyhow::bail!("connection reset by peer")
                    }
                    Ok(attempt)
                }
            },
            &fast_config(5),
        )
        .await;

        assert!(outcome.success());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff
        assert!(outcome.elapsed >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_short_circuits() {
        let outcome: RetryOutcome<()> = execute_with_retry(
            |_| async { Err(anyhow::Error::new(SurfaceError::permanent("bad selector"))) },
            &fast_config(5),
        )
        .await;
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(AttemptError::Failed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_terminal() {
        let outcome: RetryOutcome<()> = execute_with_retry(
            |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
            &fast_config(5),
        )
        .await;
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.result.as_ref().unwrap_err().is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let outcome: RetryOutcome<()> =
            execute_with_retry(|_| async { anyhow::bail!("socket hang up") }, &fast_config(4))
                .await;
        assert_eq!(outcome.attempts, 4);
        assert!(!outcome.success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_wins_the_race() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let outcome: RetryOutcome<()> = execute_with_retry_cancellable(
            |_| async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                anyhow::bail!("timeout waiting for selector")
            },
            &fast_config(5),
            &token,
        )
        .await;
        assert!(matches!(outcome.result, Err(AttemptError::Cancelled)));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_attempt_cannot_mutate_after_timeout() {
        let touched = Arc::new(AtomicU32::new(0));
        let t = Arc::clone(&touched);
        let res = race(
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                t.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Some(Duration::from_millis(50)),
            None,
        )
        .await;
        assert!(res.unwrap_err().is_timeout());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(touched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progressive_timeout_uses_larger_budget() {
        let value = execute_with_progressive_timeout(
            |_budget| async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(7)
            },
            &[
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_millis(200),
            ],
        )
        .await
        .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progressive_timeout_propagates_last_error() {
        let err = execute_with_progressive_timeout::<(), _, _>(
            |budget| async move { anyhow::bail!("failed with {}ms", budget.as_millis()) },
            &[Duration::from_millis(10), Duration::from_millis(20)],
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("20ms"));
    }
}
