//! Bounded exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use chrono::TimeDelta;
use tokio::time::sleep;
use tracing::warn;

/// Delay before retry number `attempt` (zero based): `initial * 2^attempt`, capped.
#[must_use]
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt);
    initial.saturating_mul(multiplier).min(max)
}

/// [`backoff_delay`] for wall-clock scheduling.
#[must_use]
pub fn backoff_delta(attempt: u32, initial: Duration, max: Duration) -> TimeDelta {
    TimeDelta::from_std(backoff_delay(attempt, initial, max)).unwrap_or(TimeDelta::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How often and how patiently to retry a fallible async operation.
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Run `operation` until it succeeds or retries are exhausted.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries => {
                    let delay = backoff_delay(attempt, self.initial_delay, self.max_delay);
                    attempt += 1;
                    warn!(
                        operation = what,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Retrying after failure"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
