//! Recording action executor
//!
//! Accepts every submission, assigns it a fresh execution id and keeps it
//! so `find_execution` can answer for its cause. Stands in for a real
//! execution subsystem in local runs and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use rulestream_core::{ActionExecutor, EnforcementKey, SubmissionError};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

/// One accepted execution request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub execution_id: String,
    pub action_ref: String,
    pub parameters: Map<String, Value>,
    pub cause: EnforcementKey,
}

#[derive(Debug, Default)]
pub struct RecordingExecutor {
    submissions: Mutex<Vec<Submission>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every submission in arrival order
    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn submit(
        &self,
        action_ref: &str,
        parameters: &Map<String, Value>,
        cause: &EnforcementKey,
    ) -> Result<String, SubmissionError> {
        let execution_id = Uuid::new_v4().to_string();
        let rendered = Value::Object(parameters.clone());
        info!(
            action = action_ref,
            execution = %execution_id,
            cause = %cause,
            parameters = %rendered,
            "Execution requested"
        );
        self.submissions.lock().push(Submission {
            execution_id: execution_id.clone(),
            action_ref: action_ref.to_string(),
            parameters: parameters.clone(),
            cause: cause.clone(),
        });
        Ok(execution_id)
    }

    async fn find_execution(
        &self,
        cause: &EnforcementKey,
    ) -> Result<Option<String>, SubmissionError> {
        Ok(self
            .submissions
            .lock()
            .iter()
            .rev()
            .find(|s| &s.cause == cause)
            .map(|s| s.execution_id.clone()))
    }
}
