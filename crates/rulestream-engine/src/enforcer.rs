//! Rule enforcement
//!
//! Turns one (trigger instance, rule) pair into exactly one terminal
//! enforcement record and at most one submitted execution.
//!
//! The pair is claimed by inserting a `matched` record. Whoever inserts
//! the claim owns the pair; everyone else sees the existing record. A
//! claim left behind by a crashed worker is resolved by asking the
//! executor whether an execution for the pair already exists, and only
//! taken over once it is older than the claim lease.

use chrono::Utc;
use rulestream_core::{
    ActionExecutor, EnforcementKey, EnforcementStore, InsertOutcome, Result, Rule,
    RuleEnforcement, SubmissionError, TriggerInstance,
};
use rulestream_telemetry::MetricsCollector;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::render::ParameterRenderer;
use crate::retry::RetryPolicy;

/// Record produced by one enforcement call
#[derive(Debug, Clone, PartialEq)]
pub struct EnforceOutcome {
    pub record: RuleEnforcement,

    /// The record was produced by an earlier call; nothing happened now.
    /// Also true for a claim still in flight elsewhere.
    pub replayed: bool,
}

enum Claim {
    /// This call owns the pair and must submit
    Owned(RuleEnforcement),
    /// Nothing to submit
    Settled(EnforceOutcome),
}

pub struct Enforcer {
    executor: Arc<dyn ActionExecutor>,
    store: Arc<dyn EnforcementStore>,
    renderer: ParameterRenderer,
    retry: RetryPolicy,
    submission_timeout: Duration,
    claim_lease: Duration,
    metrics: Option<MetricsCollector>,
}

impl Enforcer {
    pub fn new(
        executor: Arc<dyn ActionExecutor>,
        store: Arc<dyn EnforcementStore>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            executor,
            store,
            renderer: ParameterRenderer::new(),
            retry: config.submission_retry.clone(),
            submission_timeout: config.submission_timeout(),
            claim_lease: config.claim_lease(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn EnforcementStore> {
        &self.store
    }

    /// Enforce `rule` for `instance`.
    ///
    /// Returns the pair's record: terminal, or `matched` when another
    /// worker holds a fresh claim. Store failures are returned as errors.
    pub async fn enforce(
        &self,
        instance: &TriggerInstance,
        rule: &Rule,
    ) -> Result<RuleEnforcement> {
        Ok(self.enforce_outcome(instance, rule).await?.record)
    }

    /// Like [`Enforcer::enforce`], also reporting whether this call did the work
    pub async fn enforce_outcome(
        &self,
        instance: &TriggerInstance,
        rule: &Rule,
    ) -> Result<EnforceOutcome> {
        let key = EnforcementKey::new(&instance.id, &rule.id);
        let claim = match self.claim(&key, rule).await? {
            Claim::Owned(claim) => claim,
            Claim::Settled(outcome) => return Ok(outcome),
        };

        let record = match self.render_and_submit(instance, rule, &key).await {
            Ok((execution_id, attempts)) => claim.into_enforced(execution_id, attempts),
            Err((reason, attempts)) => claim.into_failed(reason, attempts),
        };

        let finalized = self.store.finalize(record.clone()).await?;
        if finalized.is_finalized() {
            return Ok(EnforceOutcome {
                record: finalized.into_record(),
                replayed: false,
            });
        }

        let stored = finalized.into_record();
        if record.execution_id.is_some() && record.execution_id != stored.execution_id {
            error!(
                trigger_instance = %key.trigger_instance_id,
                rule = %stored.rule_ref,
                execution = ?record.execution_id,
                status = %stored.status,
                "Enforcement claim lost after submitting; execution is not recorded"
            );
        } else {
            warn!(
                trigger_instance = %key.trigger_instance_id,
                rule = %stored.rule_ref,
                status = %stored.status,
                "Enforcement already finalized by another worker"
            );
        }
        Ok(EnforceOutcome {
            record: stored,
            replayed: true,
        })
    }

    async fn claim(&self, key: &EnforcementKey, rule: &Rule) -> Result<Claim> {
        let existing = match self
            .store
            .insert_if_absent(RuleEnforcement::claim(key.clone(), rule.reference()))
            .await?
        {
            InsertOutcome::Inserted(claim) => {
                debug!(
                    trigger_instance = %key.trigger_instance_id,
                    rule = %claim.rule_ref,
                    "Claimed enforcement"
                );
                return Ok(Claim::Owned(claim));
            }
            InsertOutcome::Existing(existing) => existing,
        };

        if existing.is_terminal() {
            debug!(
                trigger_instance = %key.trigger_instance_id,
                rule = %existing.rule_ref,
                status = %existing.status,
                "Enforcement already recorded"
            );
            return Ok(Claim::Settled(EnforceOutcome {
                record: existing,
                replayed: true,
            }));
        }

        self.recover(existing).await
    }

    /// Resolve a `matched` record this call did not create
    async fn recover(&self, existing: RuleEnforcement) -> Result<Claim> {
        let key = existing.key.clone();

        match self.executor.find_execution(&key).await {
            Ok(Some(execution_id)) => {
                info!(
                    trigger_instance = %key.trigger_instance_id,
                    rule = %existing.rule_ref,
                    execution = %execution_id,
                    "Recovered execution for unfinished claim"
                );
                let attempts = existing.attempts.max(1);
                let record = existing.into_enforced(execution_id, attempts);
                let finalized = self.store.finalize(record).await?;
                let replayed = !finalized.is_finalized();
                return Ok(Claim::Settled(EnforceOutcome {
                    record: finalized.into_record(),
                    replayed,
                }));
            }
            Ok(None) => {}
            Err(e) => {
                // cannot tell whether it was submitted; leave it for a later delivery
                warn!(
                    trigger_instance = %key.trigger_instance_id,
                    rule = %existing.rule_ref,
                    error = %e,
                    "Execution lookup failed for unfinished claim"
                );
                return Ok(Claim::Settled(EnforceOutcome {
                    record: existing,
                    replayed: true,
                }));
            }
        }

        let lease = chrono::Duration::from_std(self.claim_lease)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        match self.store.reclaim_stale(&key, Utc::now() - lease).await? {
            Some(claim) => {
                info!(
                    trigger_instance = %key.trigger_instance_id,
                    rule = %claim.rule_ref,
                    "Took over stale enforcement claim"
                );
                Ok(Claim::Owned(claim))
            }
            None => {
                // fresh claim owned elsewhere, or finished meanwhile
                let current = self.store.get(&key).await?.unwrap_or(existing);
                Ok(Claim::Settled(EnforceOutcome {
                    record: current,
                    replayed: true,
                }))
            }
        }
    }

    /// Render and submit; `Ok((execution_id, attempts))` or `Err((reason, attempts))`
    async fn render_and_submit(
        &self,
        instance: &TriggerInstance,
        rule: &Rule,
        key: &EnforcementKey,
    ) -> std::result::Result<(String, u32), (String, u32)> {
        let parameters = self.renderer.render(instance, rule).map_err(|e| {
            warn!(
                trigger_instance = %instance.id,
                rule = %rule.reference(),
                error = %e,
                "Parameter rendering failed"
            );
            (e.to_string(), 0)
        })?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self
                .submit_once(&rule.action.action_ref, &parameters, key)
                .await
            {
                Ok(execution_id) => return Ok((execution_id, attempt)),
                Err(e) => e,
            };

            if error.is_timeout() {
                // the abandoned request may still have been accepted
                if let Ok(Some(execution_id)) = self.executor.find_execution(key).await {
                    info!(
                        trigger_instance = %instance.id,
                        rule = %rule.reference(),
                        execution = %execution_id,
                        "Timed-out submission was accepted"
                    );
                    return Ok((execution_id, attempt));
                }
            }

            if !error.is_transient() || !self.retry.should_retry(attempt) {
                return Err((error.to_string(), attempt));
            }

            let delay = self.retry.delay_for(attempt);
            warn!(
                trigger_instance = %instance.id,
                rule = %rule.reference(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Submission failed, retrying"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_submission_retry();
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn submit_once(
        &self,
        action_ref: &str,
        parameters: &serde_json::Map<String, serde_json::Value>,
        key: &EnforcementKey,
    ) -> std::result::Result<String, SubmissionError> {
        tokio::time::timeout(
            self.submission_timeout,
            self.executor.submit(action_ref, parameters, key),
        )
        .await
        .unwrap_or_else(|_| {
            Err(SubmissionError::timeout(
                self.submission_timeout.as_millis() as u64,
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RecordingExecutor;
    use crate::store::InMemoryEnforcementStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rulestream_core::EnforcementStatus;
    use serde_json::{json, Map, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays scripted submission results, then succeeds
    #[derive(Default)]
    struct ScriptedExecutor {
        script: Mutex<VecDeque<std::result::Result<String, SubmissionError>>>,
        latency: Option<Duration>,
        calls: AtomicU32,
        accepted: Mutex<Vec<(EnforcementKey, String)>>,
    }

    impl ScriptedExecutor {
        fn with_script(script: Vec<std::result::Result<String, SubmissionError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ActionExecutor for ScriptedExecutor {
        async fn submit(
            &self,
            _action_ref: &str,
            _parameters: &Map<String, Value>,
            cause: &EnforcementKey,
        ) -> std::result::Result<String, SubmissionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            let next = self.script.lock().pop_front();
            let result = next.unwrap_or_else(|| Ok(format!("exec-{}", n)));
            if let Ok(id) = &result {
                self.accepted.lock().push((cause.clone(), id.clone()));
            }
            result
        }

        async fn find_execution(
            &self,
            cause: &EnforcementKey,
        ) -> std::result::Result<Option<String>, SubmissionError> {
            Ok(self
                .accepted
                .lock()
                .iter()
                .find(|(k, _)| k == cause)
                .map(|(_, id)| id.clone()))
        }
    }

    fn config(max_attempts: u32) -> EngineConfig {
        EngineConfig {
            submission_retry: RetryPolicy::immediate(max_attempts),
            submission_timeout_ms: 100,
            ..Default::default()
        }
    }

    fn instance() -> TriggerInstance {
        TriggerInstance::new("core.st2.generic", json!({"host": "web-1"})).with_id("ti-1")
    }

    fn rule() -> Rule {
        Rule::new("ops", "restart", "core.st2.generic", "core.local")
            .with_id("r1")
            .with_parameter("cmd", "restart {{ trigger.host }}")
    }

    fn enforcer(
        executor: Arc<dyn ActionExecutor>,
        store: Arc<InMemoryEnforcementStore>,
        max_attempts: u32,
    ) -> Enforcer {
        Enforcer::new(executor, store, &config(max_attempts))
    }

    #[tokio::test]
    async fn test_enforce_submits_rendered_parameters() {
        let executor = Arc::new(RecordingExecutor::new());
        let store = Arc::new(InMemoryEnforcementStore::new());
        let enforcer = enforcer(executor.clone(), store.clone(), 3);

        let record = enforcer.enforce(&instance(), &rule()).await.unwrap();

        assert_eq!(record.status, EnforcementStatus::Enforced);
        assert_eq!(record.attempts, 1);
        let submissions = executor.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].parameters["cmd"], json!("restart web-1"));
        assert_eq!(record.execution_id, Some(submissions[0].execution_id.clone()));
    }

    #[tokio::test]
    async fn test_double_enforce_is_idempotent() {
        let executor = Arc::new(RecordingExecutor::new());
        let store = Arc::new(InMemoryEnforcementStore::new());
        let enforcer = enforcer(executor.clone(), store.clone(), 3);

        let first = enforcer.enforce_outcome(&instance(), &rule()).await.unwrap();
        let second = enforcer.enforce_outcome(&instance(), &rule()).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.record, second.record);
        assert_eq!(executor.submission_count(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let executor = Arc::new(ScriptedExecutor::with_script(vec![
            Err(SubmissionError::transient("503")),
            Err(SubmissionError::transient("503")),
            Err(SubmissionError::transient("connection reset")),
            Ok("exec-ok".into()),
        ]));
        let store = Arc::new(InMemoryEnforcementStore::new());
        let enforcer = enforcer(executor.clone(), store.clone(), 5);

        let record = enforcer.enforce(&instance(), &rule()).await.unwrap();

        assert_eq!(record.status, EnforcementStatus::Enforced);
        assert_eq!(record.execution_id.as_deref(), Some("exec-ok"));
        assert_eq!(record.attempts, 4);
        assert_eq!(executor.calls(), 4);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_cap_exhausted() {
        let executor = Arc::new(ScriptedExecutor::with_script(vec![
            Err(SubmissionError::transient("503")),
            Err(SubmissionError::transient("503")),
            Err(SubmissionError::transient("503")),
        ]));
        let store = Arc::new(InMemoryEnforcementStore::new());
        let enforcer = enforcer(executor.clone(), store, 3);

        let record = enforcer.enforce(&instance(), &rule()).await.unwrap();

        assert_eq!(record.status, EnforcementStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert!(record.reason.unwrap().contains("503"));
        assert_eq!(executor.calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let executor = Arc::new(ScriptedExecutor::with_script(vec![Err(
            SubmissionError::permanent("unknown action"),
        )]));
        let store = Arc::new(InMemoryEnforcementStore::new());
        let enforcer = enforcer(executor.clone(), store, 5);

        let record = enforcer.enforce(&instance(), &rule()).await.unwrap();

        assert_eq!(record.status, EnforcementStatus::Failed);
        assert_eq!(record.attempts, 1);
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn test_render_failure_never_submits() {
        let executor = Arc::new(RecordingExecutor::new());
        let store = Arc::new(InMemoryEnforcementStore::new());
        let enforcer = enforcer(executor.clone(), store, 3);
        let rule = rule().with_parameter("broken", "{{ trigger.host ");

        let record = enforcer.enforce(&instance(), &rule).await.unwrap();

        assert_eq!(record.status, EnforcementStatus::Failed);
        assert_eq!(record.attempts, 0);
        assert!(record.reason.unwrap().contains("broken"));
        assert_eq!(executor.submission_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let executor = Arc::new(ScriptedExecutor {
            latency: Some(Duration::from_secs(3600)),
            ..Default::default()
        });
        let store = Arc::new(InMemoryEnforcementStore::new());
        let enforcer = enforcer(executor.clone(), store, 2);

        let record = enforcer.enforce(&instance(), &rule()).await.unwrap();

        assert_eq!(record.status, EnforcementStatus::Failed);
        assert_eq!(record.attempts, 2);
        assert!(record.reason.unwrap().contains("timed out"));
        assert_eq!(executor.calls(), 2);
    }

    #[tokio::test]
    async fn test_recovers_execution_from_crashed_claim() {
        let executor = Arc::new(RecordingExecutor::new());
        let store = Arc::new(InMemoryEnforcementStore::new());
        let key = EnforcementKey::new("ti-1", "r1");

        // a previous owner submitted, then died before finalizing
        store
            .insert_if_absent(RuleEnforcement::claim(key.clone(), "ops.restart"))
            .await
            .unwrap();
        let execution_id = executor
            .submit("core.local", &Map::new(), &key)
            .await
            .unwrap();

        let enforcer = enforcer(executor.clone(), store.clone(), 3);
        let outcome = enforcer.enforce_outcome(&instance(), &rule()).await.unwrap();

        assert!(!outcome.replayed);
        assert_eq!(outcome.record.status, EnforcementStatus::Enforced);
        assert_eq!(outcome.record.execution_id, Some(execution_id));
        assert_eq!(executor.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_fresh_foreign_claim_stays_in_flight() {
        let executor = Arc::new(RecordingExecutor::new());
        let store = Arc::new(InMemoryEnforcementStore::new());
        let key = EnforcementKey::new("ti-1", "r1");
        store
            .insert_if_absent(RuleEnforcement::claim(key, "ops.restart"))
            .await
            .unwrap();

        let enforcer = enforcer(executor.clone(), store, 3);
        let outcome = enforcer.enforce_outcome(&instance(), &rule()).await.unwrap();

        assert!(outcome.replayed);
        assert_eq!(outcome.record.status, EnforcementStatus::Matched);
        assert_eq!(executor.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_claim_is_taken_over() {
        let executor = Arc::new(RecordingExecutor::new());
        let store = Arc::new(InMemoryEnforcementStore::new());
        let mut claim = RuleEnforcement::claim(EnforcementKey::new("ti-1", "r1"), "ops.restart");
        claim.claimed_at = Utc::now() - chrono::Duration::hours(1);
        store.insert_if_absent(claim).await.unwrap();

        let enforcer = enforcer(executor.clone(), store, 3);
        let record = enforcer.enforce(&instance(), &rule()).await.unwrap();

        assert_eq!(record.status, EnforcementStatus::Enforced);
        assert_eq!(executor.submission_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_owner_does_not_overwrite_taken_over_claim() {
        let executor = Arc::new(ScriptedExecutor {
            latency: Some(Duration::from_secs(2)),
            ..Default::default()
        });
        let store = Arc::new(InMemoryEnforcementStore::new());
        let config = EngineConfig {
            submission_retry: RetryPolicy::immediate(1),
            submission_timeout_ms: 10_000,
            ..Default::default()
        };
        let slow = Enforcer::new(executor.clone(), store.clone(), &config);
        let first = tokio::spawn(async move { slow.enforce_outcome(&instance(), &rule()).await });

        // wait for the first owner to claim and start submitting
        while executor.calls() == 0 {
            tokio::task::yield_now().await;
        }
        let key = EnforcementKey::new("ti-1", "r1");
        let taken_over = store
            .reclaim_stale(&key, Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();

        let outcome = first.await.unwrap().unwrap();
        assert!(outcome.replayed);
        assert_eq!(outcome.record.status, EnforcementStatus::Matched);
        assert_eq!(outcome.record.claimed_at, taken_over.claimed_at);
        assert_eq!(store.count_with_status(EnforcementStatus::Matched), 1);
    }
}
