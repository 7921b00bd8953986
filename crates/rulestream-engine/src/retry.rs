//! Bounded exponential backoff

use rulestream_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry cap and backoff curve for one kind of operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: initial_backoff.as_millis() as u64,
            max_backoff_ms: max_backoff.as_millis() as u64,
            multiplier: default_multiplier(),
        }
    }

    /// Retry without waiting; useful in tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after the `attempt`-th failure (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential_backoff(
            self.initial_backoff_ms,
            self.max_backoff_ms,
            self.multiplier,
            attempt,
        )
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config(format!("{}.max_attempts must be at least 1", name)));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::config(format!("{}.multiplier must be >= 1.0", name)));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(Error::config(format!(
                "{}.max_backoff_ms must not be below initial_backoff_ms",
                name
            )));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// `initial * multiplier^(attempt - 1)`, capped at `max`
pub fn exponential_backoff(initial_ms: u64, max_ms: u64, multiplier: f64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63) as i32;
    let delay = initial_ms as f64 * multiplier.powi(exponent);
    let capped = if delay.is_finite() {
        delay.min(max_ms as f64)
    } else {
        max_ms as f64
    };
    Duration::from_millis(capped as u64)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}
