//! Retry policy for failed track conversions.
//!
//! Implements exponential backoff with configurable parameters.

use super::errors::ConvertError;
use crate::config::ProcessingSettings;
use std::time::Duration;

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per track before it is marked failed.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum delay between attempts (cap for exponential growth).
    pub max_backoff_ms: u64,
    /// Multiplier applied to the delay after each retry.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Create a new RetryPolicy from configuration settings.
    pub fn new(config: &ProcessingSettings) -> Self {
        Self {
            max_attempts: config.max_retries_per_track,
            initial_backoff_ms: config.retry_backoff_ms,
            max_backoff_ms: config.max_retry_backoff_ms,
            backoff_multiplier: config.retry_backoff_multiplier,
        }
    }

    /// Whether another attempt should follow `attempts` failed ones.
    pub fn should_retry(&self, error: &ConvertError, attempts: u32) -> bool {
        error.is_retryable() && attempts < self.max_attempts
    }

    /// Delay before the retry following `attempts` failed attempts.
    ///
    /// `initial_backoff * multiplier^(attempts - 1)`, capped at `max_backoff_ms`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let backoff = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(backoff.min(self.max_backoff_ms as f64) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&ProcessingSettings::default())
    }
}
