//! Rulestream Rules
//!
//! Declarative rule matching for trigger instances.
//!
//! Provides:
//! - Field path resolution over semi-structured payloads
//! - The criteria evaluator and its operator table
//! - Loading rule documents (YAML/JSON) from disk
//! - A versioned, copy-on-write rule index keyed by trigger type
//! - The matcher that turns one trigger instance into matched rules

pub mod document;
pub mod evaluator;
pub mod index;
pub mod matcher;
pub mod path;

pub use document::{load_rules_dir, load_rules_file, parse_rules, LoadReport};
pub use evaluator::CriteriaEvaluator;
pub use index::{RuleIndex, RuleIndexSnapshot};
pub use matcher::{MatchOutcome, Matcher, SkippedRule};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::evaluator::CriteriaEvaluator;
    pub use crate::index::{RuleIndex, RuleIndexSnapshot};
    pub use crate::matcher::{MatchOutcome, Matcher};
}
