//! Bounded retry with exponential backoff.
//!
//! The number of retries depends on the failure class of each error:
//! recoverable failures use the caller's budget, generic failures are
//! retried once, unrecoverable failures are returned immediately.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FailureClass, Result};

/// Retry and backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Default retry budget for recoverable failures (0 = no retries).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: f64,
    /// Upper bound on the delay between retries.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 250,
            backoff_factor: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    /// No delay between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay_ms: 0,
            backoff_factor: 1.0,
            max_delay_ms: 0,
        }
    }

    /// Reject settings that cannot produce a delay.
    pub fn check(&self) -> std::result::Result<(), String> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 0.0 {
            return Err(format!(
                "backoff_factor must be a non-negative number, got {}",
                self.backoff_factor
            ));
        }
        Ok(())
    }

    /// The delay after `delay`, clamped to `0..=max_delay_ms`.
    fn next_delay(&self, delay: Duration) -> Duration {
        let max = Duration::from_millis(self.max_delay_ms);
        let next = delay.as_secs_f64() * self.backoff_factor;
        Duration::try_from_secs_f64(next).map_or(max, |d| d.min(max))
    }
}

/// Run `op` until it succeeds or its error's retry budget is spent.
///
/// Returns the final result and the number of attempts made.
pub async fn run_with_retry<T, F, Fut>(config: &RetryConfig, recoverable_budget: u32, mut op: F) -> (Result<T>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(config.initial_delay_ms);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => return (Ok(value), attempt),
            Err(e) => e,
        };
        let budget = match err.class() {
            FailureClass::Recoverable => recoverable_budget,
            FailureClass::Generic => 1,
            FailureClass::Unrecoverable => 0,
        };
        if attempt > budget {
            return (Err(err), attempt);
        }
        tracing::warn!(
            tool = %err.tool_id(),
            attempt,
            class = %err.class(),
            error = %err,
            delay = ?delay,
            "tool call failed, retrying"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        delay = config.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn attempts_for(make: fn() -> ToolError, budget: u32) -> u32 {
        let calls = AtomicU32::new(0);
        let (result, attempts) = run_with_retry::<(), _, _>(&RetryConfig::immediate(budget), budget, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(make()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), attempts);
        attempts
    }

    #[tokio::test]
    async fn recoverable_uses_full_budget() {
        let n = attempts_for(|| ToolError::Server { tool_id: "t".into(), status: 503 }, 3).await;
        assert_eq!(n, 4);
    }

    #[tokio::test]
    async fn generic_retries_once() {
        let n = attempts_for(|| ToolError::Execution { tool_id: "t".into(), reason: "x".into() }, 3).await;
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn unrecoverable_never_retries() {
        let n = attempts_for(
            || ToolError::Client { tool_id: "t".into(), status: 400, body: String::new() },
            3,
        )
        .await;
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn success_after_transient_failure() {
        let (result, attempts) = run_with_retry(&RetryConfig::immediate(2), 2, |attempt| async move {
            if attempt < 2 {
                Err(ToolError::Timeout { tool_id: "t".into(), timeout_ms: 10 })
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts, 2);
    }

    #[test]
    fn backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay_ms: 100,
            backoff_factor: 10.0,
            max_delay_ms: 500,
        };
        assert_eq!(config.next_delay(Duration::from_millis(100)), Duration::from_millis(500));
    }

    #[test]
    fn invalid_backoff_factor_never_panics() {
        for factor in [-1.0, f64::NAN, f64::INFINITY] {
            let config = RetryConfig {
                backoff_factor: factor,
                initial_delay_ms: 1,
                max_delay_ms: 20,
                ..RetryConfig::default()
            };
            assert!(config.check().is_err(), "factor {factor}");
            assert!(config.next_delay(Duration::from_millis(1)) <= Duration::from_millis(20));
        }
        assert!(RetryConfig::default().check().is_ok());
    }

    #[tokio::test]
    async fn negative_backoff_still_retries() {
        let config = RetryConfig {
            max_retries: 2,
            initial_delay_ms: 1,
            backoff_factor: -1.0,
            max_delay_ms: 5,
        };
        let (result, attempts) = run_with_retry::<(), _, _>(&config, 2, |_| async {
            Err(ToolError::Server { tool_id: "t".into(), status: 503 })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }
}
