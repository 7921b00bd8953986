//! Rule enforcement records
//!
//! One record exists per (trigger instance, rule) pair. The record is the
//! single source of truth for whether a pair has already been handled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Composite key of an enforcement record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnforcementKey {
    pub trigger_instance_id: String,
    pub rule_id: String,
}

impl EnforcementKey {
    pub fn new(trigger_instance_id: impl Into<String>, rule_id: impl Into<String>) -> Self {
        Self {
            trigger_instance_id: trigger_instance_id.into(),
            rule_id: rule_id.into(),
        }
    }
}

impl fmt::Display for EnforcementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.trigger_instance_id, self.rule_id)
    }
}

/// Status of an enforcement record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementStatus {
    /// Claimed, enforcement in progress
    Matched,
    /// Execution submitted
    Enforced,
    /// Rendering or submission failed
    Failed,
    /// Criteria could not be evaluated
    Skipped,
}

impl EnforcementStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Matched)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::Enforced => "enforced",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for EnforcementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit and idempotency record for one (trigger instance, rule) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEnforcement {
    pub key: EnforcementKey,

    /// `pack.name` of the rule
    pub rule_ref: String,

    pub status: EnforcementStatus,

    /// Execution reference when enforced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,

    /// Failure or skip reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Submission attempts made
    #[serde(default)]
    pub attempts: u32,

    /// When the current owner claimed the pair
    pub claimed_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RuleEnforcement {
    /// New in-flight claim
    pub fn claim(key: EnforcementKey, rule_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key,
            rule_ref: rule_ref.into(),
            status: EnforcementStatus::Matched,
            execution_id: None,
            reason: None,
            attempts: 0,
            claimed_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Terminal record for a rule whose criteria could not be evaluated
    pub fn skipped(
        key: EnforcementKey,
        rule_ref: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let mut record = Self::claim(key, rule_ref);
        record.status = EnforcementStatus::Skipped;
        record.reason = Some(reason.into());
        record
    }

    /// Finish as enforced
    pub fn into_enforced(mut self, execution_id: impl Into<String>, attempts: u32) -> Self {
        self.status = EnforcementStatus::Enforced;
        self.execution_id = Some(execution_id.into());
        self.reason = None;
        self.attempts = attempts;
        self.updated_at = Utc::now();
        self
    }

    /// Finish as failed
    pub fn into_failed(mut self, reason: impl Into<String>, attempts: u32) -> Self {
        self.status = EnforcementStatus::Failed;
        self.reason = Some(reason.into());
        self.attempts = attempts;
        self.updated_at = Utc::now();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
