//! Bounded exponential backoff for broker connectivity probes.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for establishing the broker connection
///
/// The delay before retry `n` (0-indexed) is
/// `initial_backoff_ms * multiplier^n`, capped at `max_backoff_ms`, plus up to
/// 25% jitter when enabled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay
    pub max_backoff_ms: u64,
    /// Growth factor between retries
    pub multiplier: f64,
    /// Add jitter to spread out reconnect storms
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once and never waits
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Calculate the delay after failed attempt N (0-indexed)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(exp);
        let capped = if base.is_finite() {
            base.min(self.max_backoff_ms as f64)
        } else {
            self.max_backoff_ms as f64
        };

        let millis = if self.jitter {
            let jitter = rand::random::<f64>() * 0.25;
            capped * (1.0 + jitter)
        } else {
            capped
        };

        Duration::from_millis(millis.max(0.0) as u64)
    }
}

/// Run `op` until it succeeds or the policy runs out of attempts
///
/// `op` receives the 0-indexed attempt number. The error of the last attempt
/// is returned when every attempt fails.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 >= attempts => {
                tracing::warn!(attempts, error = %e, "Giving up after final attempt");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );
                // Exponential backoff between connectivity probes
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
