//! Retry policy with exponential backoff
//!
//! Used two ways: the consumer runtime derives advisory redelivery delays
//! from the attempt number, and transient store operations (bridge appends,
//! startup connects) retry inline before escalating.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

/// Exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First delay.
    pub base: Duration,
    /// Multiplier applied per attempt.
    pub factor: u32,
    /// Upper bound on any single delay.
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_ms: u64, factor: u32, cap_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            factor,
            cap: Duration::from_millis(cap_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based; attempt 1 → base).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = (self.factor as u64).saturating_pow(exp);
        let delay = self
            .base
            .saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX));
        delay.min(self.cap)
    }
}

/// Retry a fallible async operation with exponential backoff.
///
/// # Arguments
/// * `operation` - the async operation to retry
/// * `policy` - backoff parameters
/// * `max_attempts` - total attempts before giving up
/// * `context` - context string for logging (e.g. "bridge_forward")
///
/// # Returns
/// * `Ok(T)` if the operation succeeds within `max_attempts`
/// * `Err(E)` once all attempts are exhausted
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    policy: &RetryPolicy,
    max_attempts: u32,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        context = %context,
                        attempt = attempt,
                        "operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= max_attempts {
                    warn!(
                        context = %context,
                        attempts = attempt,
                        error = %e,
                        "operation failed after max retries"
                    );
                    return Err(e);
                }

                let backoff = policy.delay_for(attempt);
                warn!(
                    context = %context,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "operation failed, retrying with backoff"
                );
                sleep(backoff).await;
            }
        }
    }
}
