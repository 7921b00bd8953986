//! Interfaces to the systems the engine sits between
//!
//! The engine only ever talks to these traits; reference in-memory
//! implementations live in `rulestream-engine`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::enforcement::{EnforcementKey, RuleEnforcement};
use crate::error::{Result, SubmissionError};
use crate::rule::Rule;
use crate::types::{TriggerInstance, TriggerInstanceStatus};

/// Notification that the rule set changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleChange {
    /// A rule was created or edited
    Upserted(String),
    /// A rule was deleted or disabled
    Removed(String),
    /// The whole rule set was reloaded
    Reloaded,
}

/// Read access to registered rules
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// All enabled rules, in registration order
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>>;

    /// Change notifications, if the repository supports them.
    /// Without them the rule index falls back to polling.
    fn subscribe_to_changes(&self) -> Option<broadcast::Receiver<RuleChange>> {
        None
    }
}

/// The action-execution subsystem
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Submit an execution request, returning its execution reference
    async fn submit(
        &self,
        action_ref: &str,
        parameters: &Map<String, Value>,
        cause: &EnforcementKey,
    ) -> std::result::Result<String, SubmissionError>;

    /// Look up an execution previously submitted for `cause`
    async fn find_execution(
        &self,
        cause: &EnforcementKey,
    ) -> std::result::Result<Option<String>, SubmissionError>;
}

/// Outcome of an insert-if-absent
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The record was stored
    Inserted(RuleEnforcement),
    /// A record for the key already existed and is returned unchanged
    Existing(RuleEnforcement),
}

/// Result of [`EnforcementStore::finalize`]
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// The claim was replaced by the terminal record
    Finalized(RuleEnforcement),
    /// The pair was already terminal; the stored record is returned unchanged
    AlreadyFinal(RuleEnforcement),
    /// The claim was taken over by another owner; its current claim is returned
    ClaimLost(RuleEnforcement),
}

impl FinalizeOutcome {
    /// The record stored for the pair afterwards
    pub fn record(&self) -> &RuleEnforcement {
        match self {
            Self::Finalized(record) | Self::AlreadyFinal(record) | Self::ClaimLost(record) => {
                record
            }
        }
    }

    pub fn into_record(self) -> RuleEnforcement {
        match self {
            Self::Finalized(record) | Self::AlreadyFinal(record) | Self::ClaimLost(record) => {
                record
            }
        }
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Finalized(_))
    }
}

/// Durable enforcement records keyed by (trigger instance, rule)
#[async_trait]
pub trait EnforcementStore: Send + Sync {
    /// Atomically store `record` unless its key is already present
    async fn insert_if_absent(&self, record: RuleEnforcement) -> Result<InsertOutcome>;

    async fn get(&self, key: &EnforcementKey) -> Result<Option<RuleEnforcement>>;

    /// Atomically take over a `matched` claim made before `stale_before`.
    /// Returns the refreshed claim, or `None` if the claim is fresh or finished.
    async fn reclaim_stale(
        &self,
        key: &EnforcementKey,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<RuleEnforcement>>;

    /// Replace a `matched` claim with its terminal record.
    ///
    /// `record.claimed_at` identifies the claim being finished. A record
    /// that is already terminal, or a claim re-taken since (different
    /// `claimed_at`), is left untouched and reported instead.
    async fn finalize(&self, record: RuleEnforcement) -> Result<FinalizeOutcome>;

    /// All records for one trigger instance, ordered by rule id
    async fn list_for_trigger_instance(
        &self,
        trigger_instance_id: &str,
    ) -> Result<Vec<RuleEnforcement>>;
}

/// Processing status of trigger instances
#[async_trait]
pub trait TriggerInstanceStore: Send + Sync {
    /// Move to `status` if that is a forward transition. Returns the status
    /// in effect afterwards.
    async fn set_status(
        &self,
        trigger_instance_id: &str,
        status: TriggerInstanceStatus,
    ) -> Result<TriggerInstanceStatus>;

    async fn status(&self, trigger_instance_id: &str) -> Result<Option<TriggerInstanceStatus>>;
}

/// One delivery of a trigger instance from the event queue
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue handle used for ack/nack
    pub delivery_id: String,

    pub instance: TriggerInstance,

    /// 1 on first delivery
    pub attempt: u32,
}

/// Durable, at-least-once source of trigger instances
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Wait for the next delivery. `None` once the queue is closed and drained.
    async fn receive(&self) -> Result<Option<Delivery>>;

    /// Processing finished; never deliver this message again
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Processing failed; redeliver after `delay` or dead-letter
    async fn nack(&self, delivery: &Delivery, delay: Duration) -> Result<()>;
}
