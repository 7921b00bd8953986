//! Rulestream Core
//!
//! Core types, traits, and utilities shared across Rulestream components.
//!
//! This crate provides:
//! - Trigger instances and their semi-structured payloads
//! - Rules, criteria predicates and action specifications
//! - Enforcement records keyed by (trigger instance, rule)
//! - Error types and result handling
//! - Traits for the queue, rule repository, execution subsystem and stores

pub mod enforcement;
pub mod error;
pub mod rule;
pub mod traits;
pub mod types;

pub use enforcement::{EnforcementKey, EnforcementStatus, RuleEnforcement};
pub use error::{
    CriteriaEvalError, Error, RenderError, Result, SubmissionError, SubmissionErrorKind,
};
pub use rule::{ActionSpec, Criteria, Operator, Predicate, Rule, TriggerSpec, TypeHint};
pub use traits::{
    ActionExecutor, Delivery, EnforcementStore, EventQueue, FinalizeOutcome, InsertOutcome,
    RuleChange, RuleRepository, TriggerInstanceStore,
};
pub use types::{Payload, TriggerInstance, TriggerInstanceStatus};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::enforcement::{EnforcementKey, EnforcementStatus, RuleEnforcement};
    pub use crate::error::{Error, Result};
    pub use crate::rule::{Operator, Predicate, Rule};
    pub use crate::traits::{ActionExecutor, EnforcementStore, EventQueue, RuleRepository};
    pub use crate::types::{Payload, TriggerInstance, TriggerInstanceStatus};
}
