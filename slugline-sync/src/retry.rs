//! Bounded exponential backoff for single persistence attempts.
//!
//! The retry policy sits *inside* a circuit-breaker-guarded call: however
//! many internal attempts it makes, the breaker sees exactly one success or
//! failure. Retries only stretch the wall-clock latency of that one call.

use std::future::Future;
use std::time::Duration;

/// Retry policy with exponential backoff.
///
/// Delay before retry `n` (zero-based) is `initial_delay * 2^n`, capped at
/// `max_delay`. `max_attempts` counts total attempts including the first.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// Policy for tests: tiny delays so backoff doesn't dominate test time.
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    /// Backoff delay before the given zero-based retry number.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(retry);
        self.initial_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// Worst-case wall clock for one fully retried call, given a per-attempt
    /// timeout. Used to size the timeout of the breaker wrapping this policy.
    pub fn wall_clock_budget(&self, per_attempt: Duration) -> Duration {
        let mut total = per_attempt.saturating_mul(self.max_attempts.max(1));
        for retry in 0..self.max_attempts.saturating_sub(1) {
            total = total.saturating_add(self.delay_for(retry));
        }
        // Headroom so the outer timeout never races the final attempt
        total.saturating_add(Duration::from_millis(250))
    }

    /// Run `operation` with retries, propagating the final failure.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_when(operation, |_| true).await
    }

    /// Run `operation` with retries, but only when `should_retry` approves
    /// the error. Non-retriable failures (e.g. version conflicts) propagate
    /// immediately.
    pub async fn execute_when<F, Fut, T, E>(
        &self,
        operation: F,
        should_retry: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts.max(1) || !should_retry(&err) {
                        return Err(err);
                    }
                    tokio::time::sleep(self.delay_for(attempt - 1)).await;
                }
            }
        }
    }
}
