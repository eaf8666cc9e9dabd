//! Retry policy for failed reanalysis tasks.
//!
//! Implements exponential backoff with configurable parameters.

use crate::error::ReanalysisError;

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed before a task is marked failed, first attempt included.
    pub max_attempts: u32,
    /// Backoff after the first failed attempt, in seconds.
    pub initial_backoff_secs: u64,
    /// Cap for exponential growth, in seconds.
    pub max_backoff_secs: u64,
    /// Multiplier applied to backoff after each further failure.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Backoff in seconds after the given number of failed attempts (1-based).
    ///
    /// `initial_backoff * multiplier^(attempts - 1)`, capped at
    /// `max_backoff_secs`.
    pub fn backoff_secs(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let backoff = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        backoff.min(self.max_backoff_secs as f64) as u64
    }

    /// Unix timestamp of the next attempt after a failure at `now`.
    pub fn next_attempt_at(&self, now: i64, attempts: u32) -> i64 {
        now.saturating_add(self.backoff_secs(attempts) as i64)
    }

    /// True when the error is retryable and attempts remain.
    pub fn should_retry(&self, error: &ReanalysisError, attempts: u32) -> bool {
        error.is_retryable() && attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_secs: 30,
            max_backoff_secs: 3600,
            backoff_multiplier: 2.0,
        }
    }
}
