//! Bounded retry with exponential backoff and jitter.
//!
//! Only transient backend failures are retried; permanent ones return on the
//! first attempt. Retries are always bounded so a failing backend cannot
//! stall a rollout indefinitely.

use crate::error::BackendError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, warn};

/// Errors that know whether a retry may help
pub trait Retryable {
    /// Whether another attempt may succeed
    fn is_retryable(&self) -> bool;
}

impl Retryable for BackendError {
    fn is_retryable(&self) -> bool {
        self.transient
    }
}

/// Retry bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first (minimum 1)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Ceiling on any single delay
    pub max_delay_ms: u64,
    /// Multiplier applied after each retry
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a given number of attempts
    #[inline]
    #[must_use]
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Self::default()
        }
    }

    /// With initial delay
    #[inline]
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Delay before the first retry
    #[inline]
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Ceiling on any single delay
    #[inline]
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Check the bounds are usable; `name` prefixes the message
    ///
    /// # Errors
    /// Returns a description of the first bad value.
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err(format!("{name}.max_attempts must be > 0"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "{name}.backoff_multiplier must be finite and >= 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(format!(
                "{name}.initial_delay_ms ({}) exceeds max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            ));
        }
        Ok(())
    }

    /// Scale `delay` by `factor`, capped at `max_delay`
    ///
    /// Negative, NaN or overflowing products fall back to the ceiling.
    fn scaled(&self, delay: Duration, factor: f64) -> Duration {
        let max = self.max_delay();
        let secs = (delay.as_secs_f64() * factor).min(max.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(max).min(max)
    }
}

/// Execute an async operation with bounded exponential backoff and jitter.
///
/// Returns the first success, the first non-retryable error, or the last
/// error once `max_attempts` is exhausted, together with the number of
/// attempts made.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> (Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay().min(config.max_delay());

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return (Ok(result), attempt),
            Err(e) => {
                if !e.is_retryable() || attempt >= max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Operation failed, giving up"
                    );
                    return (Err(e), attempt);
                }

                // Jitter: 0.5x to 1.5x of the delay
                let jitter = rand::rng().random_range(0.5..1.5);
                let jittered_delay = config.scaled(delay, jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = config.scaled(delay, config.backoff_multiplier);
            }
        }
    }
}
