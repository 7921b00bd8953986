//! Core types for Rulestream

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Semi-structured event payload: scalars, ordered sequences and mappings
pub type Payload = serde_json::Value;

/// One occurrence of an external event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerInstance {
    /// Unique identifier for this occurrence
    #[serde(default = "generate_instance_id")]
    pub id: String,

    /// Trigger type reference, e.g. `core.st2.generic`
    pub trigger_type: String,

    /// Event payload
    #[serde(default)]
    pub payload: Payload,

    /// When the event occurred
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,

    /// Processing status as last observed
    #[serde(default)]
    pub status: TriggerInstanceStatus,
}

impl TriggerInstance {
    /// Create a new trigger instance with a generated id
    pub fn new(trigger_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: generate_instance_id(),
            trigger_type: trigger_type.into(),
            payload,
            occurred_at: Utc::now(),
            status: TriggerInstanceStatus::Received,
        }
    }

    /// Set an explicit id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

/// Processing status of a trigger instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerInstanceStatus {
    #[default]
    Received,
    Processing,
    ProcessingFailed,
    Processed,
}

impl TriggerInstanceStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Received => 0,
            Self::Processing => 1,
            Self::ProcessingFailed => 2,
            Self::Processed => 3,
        }
    }

    /// Status only moves forward. A failed instance may still become
    /// processed on redelivery, but never goes back to processing.
    pub fn can_transition_to(self, next: Self) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ProcessingFailed | Self::Processed)
    }
}

impl fmt::Display for TriggerInstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Processing => "processing",
            Self::ProcessingFailed => "processing_failed",
            Self::Processed => "processed",
        };
        f.write_str(s)
    }
}

fn generate_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
