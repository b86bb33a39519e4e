//! Exponential backoff around file writes and commits.
//!
//! Every call is bounded by an overall deadline; retryable failures are
//! retried with growing delays until the operation succeeds, the attempt limit
//! is reached, or the deadline passes.

use crate::config::RetryConfig;
use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_interval: Duration,
    /// Cap on a single delay
    pub max_interval: Duration,
    /// Growth factor between delays
    pub multiplier: f64,
    /// Attempt limit, unlimited when `None`
    pub max_attempts: Option<u32>,
    /// Deadline for one call including all retries
    pub per_call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            max_interval: Duration::from_millis(config.max_interval_ms),
            multiplier: config.multiplier,
            max_attempts: config.max_attempts,
            per_call_timeout: Duration::from_secs(config.per_call_timeout_seconds),
        }
    }
}

impl RetryPolicy {
    /// Limit the number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the overall deadline.
    pub fn with_per_call_timeout(mut self, timeout: Duration) -> Self {
        self.per_call_timeout = timeout;
        self
    }

    /// Set the first delay.
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn calculate_backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(64) as i32;
        let delay_ms = self.initial_interval.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_ms = self.max_interval.as_millis() as f64;
        Duration::from_millis(delay_ms.min(max_ms) as u64)
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts, or the deadline passes.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = Instant::now() + self.per_call_timeout;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());

            let outcome = match tokio::time::timeout(remaining, f()).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(self.timeout(operation)),
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation = %operation, attempts = attempt, "Succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            if self.max_attempts.is_some_and(|max| attempt >= max) {
                warn!(
                    operation = %operation,
                    attempts = attempt,
                    error = %err,
                    "Giving up after max attempts"
                );
                return Err(err);
            }

            let delay = self.calculate_backoff(attempt);
            if Instant::now() + delay >= deadline {
                warn!(operation = %operation, attempts = attempt, error = %err, "Retry deadline reached");
                return Err(self.timeout(operation));
            }

            warn!(
                operation = %operation,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Operation failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Run `f` once, bounded by the per-call deadline.
    pub async fn bounded<T, Fut>(&self, operation: &str, f: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.per_call_timeout, f)
            .await
            .map_err(|_| self.timeout(operation))?
    }

    fn timeout(&self, operation: &str) -> Error {
        Error::Timeout {
            operation: operation.to_string(),
            after: self.per_call_timeout,
        }
    }
}
