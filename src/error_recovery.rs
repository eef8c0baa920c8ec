//! Retry policy for transient instrument errors.
//
// Attempts are counted from 1. The delay before attempt `n + 1` grows
// geometrically from `initial_backoff` and is capped at `max_backoff`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Defines a policy for retrying an instrument operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Growth factor applied to the delay after each further failure.
    pub multiplier: f64,
    /// Upper bound for any single delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether another attempt may follow the failed attempt number `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after the failed attempt number `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.initial_backoff.as_secs_f64() * 1000.0 * factor;
        let capped = millis.min(self.max_backoff.as_secs_f64() * 1000.0);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}
