//! Error types for Rulestream
//!
//! Rule-local failures ([`CriteriaEvalError`], [`RenderError`],
//! [`SubmissionError`]) are turned into enforcement records by the engine.
//! Infrastructure failures travel as [`Error`].

use std::fmt;

use crate::rule::{Operator, TypeHint};

/// Result type alias using Rulestream's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Rulestream operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Criteria evaluation errors
    #[error("criteria error: {0}")]
    Criteria(#[from] CriteriaEvalError),

    /// Parameter rendering errors
    #[error("render error: {0}")]
    Render(#[from] RenderError),

    /// Action submission errors
    #[error("submission error: {0}")]
    Submission(#[from] SubmissionError),

    /// The rule repository could not be read
    #[error("rule repository unavailable: {0}")]
    RepositoryUnavailable(String),

    /// Enforcement or trigger instance store errors
    #[error("store error: {0}")]
    Store(String),

    /// Event queue errors
    #[error("queue error: {0}")]
    Queue(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Network/IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new repository-unavailable error
    pub fn repository(msg: impl Into<String>) -> Self {
        Self::RepositoryUnavailable(msg.into())
    }

    /// Create a new store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a new queue error
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RepositoryUnavailable(_) | Self::Store(_) | Self::Queue(_) | Self::Io(_) => true,
            Self::Submission(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// A predicate that cannot be evaluated as written.
///
/// Absent fields and uncastable payload values are not errors; they are
/// plain non-matches.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CriteriaEvalError {
    #[error("operator '{operator}' on '{field}' requires a value")]
    MissingOperand { field: String, operator: Operator },

    #[error("invalid regex '{pattern}' on '{field}': {reason}")]
    InvalidRegex {
        field: String,
        pattern: String,
        reason: String,
    },

    #[error("value {value} on '{field}' cannot be read as {type_hint}")]
    UncastableOperand {
        field: String,
        type_hint: TypeHint,
        value: String,
    },

    #[error("operator '{operator}' on '{field}': {reason}")]
    InvalidOperand {
        field: String,
        operator: Operator,
        reason: String,
    },
}

/// Template substitution failed for an action parameter
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("failed to render parameter '{parameter}': {reason}")]
pub struct RenderError {
    pub parameter: String,
    pub reason: String,
}

impl RenderError {
    pub fn new(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }
}

/// Whether a failed submission may succeed when retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionErrorKind {
    Transient,
    Permanent,
    /// No answer within the submission timeout; retried like `Transient`
    Timeout,
}

impl fmt::Display for SubmissionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
            Self::Timeout => f.write_str("timeout"),
        }
    }
}

/// The action-execution subsystem rejected or failed a request
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} submission failure: {message}")]
pub struct SubmissionError {
    pub kind: SubmissionErrorKind,
    pub message: String,
}

impl SubmissionError {
    /// Create a retryable submission error
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: SubmissionErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Create a non-retryable submission error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: SubmissionErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Submission did not complete within the timeout
    pub fn timeout(after_ms: u64) -> Self {
        Self {
            kind: SubmissionErrorKind::Timeout,
            message: format!("timed out after {}ms", after_ms),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == SubmissionErrorKind::Timeout
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            SubmissionErrorKind::Transient | SubmissionErrorKind::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_error_kinds() {
        assert!(SubmissionError::transient("busy").is_transient());
        assert!(!SubmissionError::permanent("no such action").is_transient());
        let timeout = SubmissionError::timeout(250);
        assert_eq!(timeout.kind, SubmissionErrorKind::Timeout);
        assert!(timeout.is_timeout());
        assert!(timeout.is_transient());
        assert!(!SubmissionError::transient("busy").is_timeout());
        assert_eq!(
            timeout.to_string(),
            "timeout submission failure: timed out after 250ms"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::repository("db down").is_retryable());
        assert!(Error::from(SubmissionError::transient("busy")).is_retryable());
        assert!(!Error::from(SubmissionError::permanent("bad ref")).is_retryable());
        assert!(Error::from(SubmissionError::timeout(100)).is_retryable());
        assert!(!Error::config("workers must be > 0").is_retryable());
    }

    #[test]
    fn test_criteria_error_message() {
        let err = CriteriaEvalError::MissingOperand {
            field: "severity".to_string(),
            operator: Operator::Equals,
        };
        assert_eq!(
            err.to_string(),
            "operator 'equals' on 'severity' requires a value"
        );
    }
}
