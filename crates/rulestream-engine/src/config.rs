//! Engine configuration

use rulestream_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Tuning for the dispatch loop and the enforcer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker tasks pulling from the event queue
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Matched rules enforced concurrently per trigger instance
    #[serde(default = "default_enforcement_concurrency")]
    pub enforcement_concurrency: usize,

    /// Timeout for a single submission attempt
    #[serde(default = "default_submission_timeout_ms")]
    pub submission_timeout_ms: u64,

    #[serde(default)]
    pub submission_retry: RetryPolicy,

    /// Retries for an unavailable rule repository during matching
    #[serde(default = "default_matching_retry")]
    pub matching_retry: RetryPolicy,

    /// Base delay before a failed delivery is redelivered
    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,

    #[serde(default = "default_max_redelivery_delay_ms")]
    pub max_redelivery_delay_ms: u64,

    /// Age after which an unfinished claim may be taken over.
    /// Must exceed [`EngineConfig::max_submission_time`].
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,

    /// Rule index polling interval
    #[serde(default = "default_index_refresh_secs")]
    pub index_refresh_secs: u64,
}

impl EngineConfig {
    /// Parse from YAML; missing fields take their defaults
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("invalid engine config: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.enforcement_concurrency == 0 {
            return Err(Error::config("enforcement_concurrency must be at least 1"));
        }
        if self.submission_timeout_ms == 0 {
            return Err(Error::config("submission_timeout_ms must be positive"));
        }
        if self.claim_lease_secs == 0 {
            return Err(Error::config("claim_lease_secs must be positive"));
        }
        if self.index_refresh_secs == 0 {
            return Err(Error::config("index_refresh_secs must be positive"));
        }
        if self.max_redelivery_delay_ms < self.redelivery_delay_ms {
            return Err(Error::config(
                "max_redelivery_delay_ms must not be below redelivery_delay_ms",
            ));
        }
        self.submission_retry.validate("submission_retry")?;
        self.matching_retry.validate("matching_retry")?;
        if self.claim_lease() <= self.max_submission_time() {
            return Err(Error::config(format!(
                "claim_lease_secs ({}s) must exceed the longest submission window ({}ms)",
                self.claim_lease_secs,
                self.max_submission_time().as_millis()
            )));
        }
        Ok(())
    }

    /// Longest time one pair can spend submitting: every attempt timing
    /// out plus the backoff between attempts
    pub fn max_submission_time(&self) -> Duration {
        let attempts = self.submission_retry.max_attempts;
        let backoff: Duration = (1..attempts)
            .map(|attempt| self.submission_retry.delay_for(attempt))
            .sum();
        self.submission_timeout()
            .saturating_mul(attempts)
            .saturating_add(backoff)
    }

    pub fn submission_timeout(&self) -> Duration {
        Duration::from_millis(self.submission_timeout_ms)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn index_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.index_refresh_secs)
    }

    /// Delay before redelivering a delivery that failed on `attempt`
    pub fn redelivery_delay(&self, attempt: u32) -> Duration {
        crate::retry::exponential_backoff(
            self.redelivery_delay_ms,
            self.max_redelivery_delay_ms,
            2.0,
            attempt,
        )
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            enforcement_concurrency: default_enforcement_concurrency(),
            submission_timeout_ms: default_submission_timeout_ms(),
            submission_retry: RetryPolicy::default(),
            matching_retry: default_matching_retry(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
            max_redelivery_delay_ms: default_max_redelivery_delay_ms(),
            claim_lease_secs: default_claim_lease_secs(),
            index_refresh_secs: default_index_refresh_secs(),
        }
    }
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_enforcement_concurrency() -> usize {
    4
}

fn default_submission_timeout_ms() -> u64 {
    10_000
}

fn default_matching_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(5))
}

fn default_redelivery_delay_ms() -> u64 {
    1_000
}

fn default_max_redelivery_delay_ms() -> u64 {
    60_000
}

fn default_claim_lease_secs() -> u64 {
    300
}

fn default_index_refresh_secs() -> u64 {
    30
}
