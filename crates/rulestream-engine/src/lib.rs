//! Rulestream Engine
//!
//! Enforces matched rules and drives trigger instances from the event
//! queue through matching and enforcement.
//!
//! Each (trigger instance, rule) pair is enforced at most once:
//! - The enforcement record is claimed before anything is submitted
//! - Crashed claims are recovered through the executor, never resubmitted blindly
//! - Redelivered instances replay the existing records
//!
//! In-memory queue, stores, repository and executor are included for
//! local runs and tests.

pub mod config;
pub mod dispatch;
pub mod enforcer;
pub mod executor;
pub mod queue;
pub mod render;
pub mod repository;
pub mod retry;
pub mod store;

pub use config::EngineConfig;
pub use dispatch::{Dispatcher, InstanceReport, InstanceState};
pub use enforcer::{EnforceOutcome, Enforcer};
pub use executor::{RecordingExecutor, Submission};
pub use queue::{InMemoryQueue, QueueStats};
pub use render::{ParameterRenderer, TemplateContext};
pub use repository::InMemoryRuleRepository;
pub use retry::RetryPolicy;
pub use store::{InMemoryEnforcementStore, InMemoryTriggerInstanceStore};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::dispatch::{Dispatcher, InstanceReport};
    pub use crate::enforcer::Enforcer;
    pub use crate::retry::RetryPolicy;
}
