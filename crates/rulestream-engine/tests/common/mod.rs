//! Mock collaborators for engine tests
//!
//! Configurable executors and stores with call counters for driving the
//! enforcer and dispatcher through failure and recovery paths.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rulestream_core::{
    ActionExecutor, EnforcementKey, EnforcementStore, Error, FinalizeOutcome, InsertOutcome,
    Result, Rule, RuleEnforcement, SubmissionError, TriggerInstance,
};
use rulestream_engine::{
    Dispatcher, EngineConfig, InMemoryEnforcementStore, InMemoryQueue, RetryPolicy,
};
use rulestream_telemetry::{OutcomeEvent, OutcomeKind, OutcomeSink};
use serde_json::{json, Map, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

pub const TRIGGER: &str = "core.st2.generic";

/// A configurable mock executor for testing
#[derive(Default)]
pub struct MockExecutor {
    /// Results returned before submissions start succeeding
    script: Mutex<VecDeque<SubmissionError>>,
    /// Actions that always fail permanently
    broken_actions: HashSet<String>,
    /// When set, each submission waits for a permit
    gate: Option<Arc<Semaphore>>,
    entered: Arc<Notify>,
    call_count: AtomicU32,
    accepted: Mutex<Vec<(EnforcementKey, String, Map<String, Value>)>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next submissions with these errors, in order
    pub fn with_failures(self, failures: Vec<SubmissionError>) -> Self {
        *self.script.lock() = failures.into();
        self
    }

    /// Fail every submission of `action_ref` permanently
    pub fn with_broken_action(mut self, action_ref: &str) -> Self {
        self.broken_actions.insert(action_ref.to_string());
        self
    }

    /// Hold submissions until [`MockExecutor::release`] is called
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// An execution that exists before the test starts
    pub fn with_existing_execution(self, cause: EnforcementKey, execution_id: &str) -> Self {
        self.accepted
            .lock()
            .push((cause, execution_id.to_string(), Map::new()));
        self
    }

    pub fn release(&self, submissions: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(submissions);
        }
    }

    /// Wait until a submission has started
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Get the number of times submit was called
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Accepted executions, pre-seeded ones included
    pub fn accepted(&self) -> Vec<(EnforcementKey, String, Map<String, Value>)> {
        self.accepted.lock().clone()
    }

    pub fn accepted_causes(&self) -> Vec<EnforcementKey> {
        self.accepted.lock().iter().map(|(k, _, _)| k.clone()).collect()
    }
}

#[async_trait]
impl ActionExecutor for MockExecutor {
    async fn submit(
        &self,
        action_ref: &str,
        parameters: &Map<String, Value>,
        cause: &EnforcementKey,
    ) -> std::result::Result<String, SubmissionError> {
        let n = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.entered.notify_one();

        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| SubmissionError::transient("gate closed"))?;
            permit.forget();
        }

        if self.broken_actions.contains(action_ref) {
            return Err(SubmissionError::permanent(format!(
                "action '{}' is not registered",
                action_ref
            )));
        }
        if let Some(error) = self.script.lock().pop_front() {
            return Err(error);
        }

        let execution_id = format!("exec-{}", n);
        self.accepted
            .lock()
            .push((cause.clone(), execution_id.clone(), parameters.clone()));
        Ok(execution_id)
    }

    async fn find_execution(
        &self,
        cause: &EnforcementKey,
    ) -> std::result::Result<Option<String>, SubmissionError> {
        Ok(self
            .accepted
            .lock()
            .iter()
            .find(|(k, _, _)| k == cause)
            .map(|(_, id, _)| id.clone()))
    }
}

/// Enforcement store whose `finalize` can be made to fail
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryEnforcementStore,
    fail_finalize: AtomicBool,
    finalize_failures: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `finalize` call
    pub fn fail_next_finalize(&self) {
        self.fail_finalize.store(true, Ordering::SeqCst);
    }

    pub fn finalize_failures(&self) -> u32 {
        self.finalize_failures.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryEnforcementStore {
        &self.inner
    }
}

#[async_trait]
impl EnforcementStore for FlakyStore {
    async fn insert_if_absent(&self, record: RuleEnforcement) -> Result<InsertOutcome> {
        self.inner.insert_if_absent(record).await
    }

    async fn get(&self, key: &EnforcementKey) -> Result<Option<RuleEnforcement>> {
        self.inner.get(key).await
    }

    async fn reclaim_stale(
        &self,
        key: &EnforcementKey,
        stale_before: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<RuleEnforcement>> {
        self.inner.reclaim_stale(key, stale_before).await
    }

    async fn finalize(&self, record: RuleEnforcement) -> Result<FinalizeOutcome> {
        if self.fail_finalize.swap(false, Ordering::SeqCst) {
            self.finalize_failures.fetch_add(1, Ordering::SeqCst);
            return Err(Error::store("write timed out"));
        }
        self.inner.finalize(record).await
    }

    async fn list_for_trigger_instance(
        &self,
        trigger_instance_id: &str,
    ) -> Result<Vec<RuleEnforcement>> {
        self.inner.list_for_trigger_instance(trigger_instance_id).await
    }
}

/// Collects every published outcome
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<OutcomeEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<OutcomeEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

impl OutcomeSink for RecordingSink {
    fn publish(&self, event: &OutcomeEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Engine config with no waiting between retries
pub fn fast_config(workers: usize) -> EngineConfig {
    EngineConfig {
        workers,
        enforcement_concurrency: 4,
        submission_timeout_ms: 1_000,
        submission_retry: RetryPolicy::immediate(5),
        matching_retry: RetryPolicy::immediate(1),
        redelivery_delay_ms: 10,
        max_redelivery_delay_ms: 10,
        index_refresh_secs: 3600,
        ..Default::default()
    }
}

pub fn severity_rule(id: &str, threshold: i64, action_ref: &str) -> Rule {
    Rule::new("monitoring", id, TRIGGER, action_ref)
        .with_id(id)
        .with_criterion(
            "trigger.severity",
            rulestream_core::Predicate::new(rulestream_core::Operator::GreaterThan, threshold),
        )
        .with_parameter("message", "{{ trigger.host }} at severity {{ trigger.severity }}")
}

pub fn event(id: &str, host: &str, severity: i64) -> TriggerInstance {
    TriggerInstance::new(TRIGGER, json!({"host": host, "severity": severity})).with_id(id)
}

/// Run the dispatcher until every published instance is acked or
/// dead-lettered, then shut it down
pub async fn run_until_settled(dispatcher: Arc<Dispatcher>, queue: Arc<InMemoryQueue>) {
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(dispatcher.run(cancel.clone()));

    let settled = tokio::time::timeout(Duration::from_secs(10), async {
        while !queue.stats().is_settled() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    cancel.cancel();
    handle
        .await
        .expect("dispatcher task panicked")
        .expect("dispatcher failed");
    assert!(settled.is_ok(), "queue did not settle: {:?}", queue.stats());
}
