//! Outcome events
//!
//! Every trigger instance produces a stream of structured outcomes:
//! per-rule matched/enforced/skipped/failed events followed by one
//! instance-level processed/failed event.

use chrono::{DateTime, Utc};
use rulestream_core::{EnforcementStatus, Rule, RuleEnforcement, TriggerInstance};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Kind of outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Matched,
    Enforced,
    Skipped,
    Failed,
    InstanceProcessed,
    InstanceFailed,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::Enforced => "enforced",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::InstanceProcessed => "instance_processed",
            Self::InstanceFailed => "instance_failed",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single structured outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub kind: OutcomeKind,

    pub trigger_instance_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_ref: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,

    /// Failure or skip reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl OutcomeEvent {
    fn new(kind: OutcomeKind, trigger_instance_id: impl Into<String>) -> Self {
        Self {
            kind,
            trigger_instance_id: trigger_instance_id.into(),
            rule_id: None,
            rule_ref: None,
            execution_id: None,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    /// A rule matched the instance
    pub fn matched(instance: &TriggerInstance, rule: &Rule) -> Self {
        let mut event = Self::new(OutcomeKind::Matched, &instance.id);
        event.rule_id = Some(rule.id.clone());
        event.rule_ref = Some(rule.reference());
        event
    }

    /// Terminal per-rule outcome from its enforcement record.
    /// Returns `None` for records still in flight.
    pub fn from_enforcement(record: &RuleEnforcement) -> Option<Self> {
        let kind = match record.status {
            EnforcementStatus::Enforced => OutcomeKind::Enforced,
            EnforcementStatus::Failed => OutcomeKind::Failed,
            EnforcementStatus::Skipped => OutcomeKind::Skipped,
            EnforcementStatus::Matched => return None,
        };

        let mut event = Self::new(kind, &record.key.trigger_instance_id);
        event.rule_id = Some(record.key.rule_id.clone());
        event.rule_ref = Some(record.rule_ref.clone());
        event.execution_id = record.execution_id.clone();
        event.reason = record.reason.clone();
        Some(event)
    }

    /// All matched rules reached a terminal state
    pub fn instance_processed(trigger_instance_id: impl Into<String>) -> Self {
        Self::new(OutcomeKind::InstanceProcessed, trigger_instance_id)
    }

    /// The instance could not be processed in this delivery
    pub fn instance_failed(trigger_instance_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut event = Self::new(OutcomeKind::InstanceFailed, trigger_instance_id);
        event.reason = Some(reason.into());
        event
    }
}

/// Consumer of outcome events
pub trait OutcomeSink: Send + Sync {
    fn publish(&self, event: &OutcomeEvent);
}

/// Writes outcomes to the tracing subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl OutcomeSink for TracingSink {
    fn publish(&self, event: &OutcomeEvent) {
        let rule = event.rule_ref.as_deref().unwrap_or("-");
        match event.kind {
            OutcomeKind::Matched => debug!(
                trigger_instance = %event.trigger_instance_id,
                rule,
                "Rule matched"
            ),
            OutcomeKind::Enforced => info!(
                trigger_instance = %event.trigger_instance_id,
                rule,
                execution = event.execution_id.as_deref().unwrap_or("-"),
                "Rule enforced"
            ),
            OutcomeKind::Skipped => warn!(
                trigger_instance = %event.trigger_instance_id,
                rule,
                reason = event.reason.as_deref().unwrap_or(""),
                "Rule skipped"
            ),
            OutcomeKind::Failed => error!(
                trigger_instance = %event.trigger_instance_id,
                rule,
                reason = event.reason.as_deref().unwrap_or(""),
                "Rule enforcement failed"
            ),
            OutcomeKind::InstanceProcessed => info!(
                trigger_instance = %event.trigger_instance_id,
                "Trigger instance processed"
            ),
            OutcomeKind::InstanceFailed => warn!(
                trigger_instance = %event.trigger_instance_id,
                reason = event.reason.as_deref().unwrap_or(""),
                "Trigger instance processing failed"
            ),
        }
    }
}

/// Fans one event out to several sinks
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn OutcomeSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl OutcomeSink for SinkSet {
    fn publish(&self, event: &OutcomeEvent) {
        for sink in &self.sinks {
            sink.publish(event);
        }
    }
}
