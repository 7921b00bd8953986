//! Dispatch loop
//!
//! A fixed pool of workers pulls trigger instances from the event queue.
//! Each instance goes `received → matching → enforcing → done | failed`
//! and is acked on `done` or nacked for redelivery on `failed`.
//! Redelivered instances are deduplicated by their enforcement records.

use futures::stream::{self, StreamExt};
use rulestream_core::{
    ActionExecutor, Delivery, EnforcementKey, EnforcementStore, EventQueue, InsertOutcome,
    Result, Rule, RuleEnforcement, TriggerInstance, TriggerInstanceStatus, TriggerInstanceStore,
};
use rulestream_rules::{Matcher, RuleIndex, RuleIndexSnapshot};
use rulestream_telemetry::{MetricsCollector, OutcomeEvent, OutcomeSink, SinkSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::EngineConfig;
use crate::enforcer::{EnforceOutcome, Enforcer};

/// Processing state of one trigger instance within a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Received,
    Matching,
    Enforcing,
    Done,
    Failed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Matching => "matching",
            Self::Enforcing => "enforcing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What happened to one trigger instance in one delivery
#[derive(Debug, Clone)]
pub struct InstanceReport {
    pub trigger_instance_id: String,

    /// `Done` or `Failed`
    pub state: InstanceState,

    /// Snapshot used for matching, if matching got that far
    pub snapshot_version: Option<u64>,

    /// Records of every matched or skipped rule
    pub records: Vec<RuleEnforcement>,

    pub error: Option<String>,
}

impl InstanceReport {
    fn new(trigger_instance_id: &str) -> Self {
        Self {
            trigger_instance_id: trigger_instance_id.to_string(),
            state: InstanceState::Received,
            snapshot_version: None,
            records: Vec::new(),
            error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == InstanceState::Done
    }
}

pub struct Dispatcher {
    queue: Arc<dyn EventQueue>,
    index: Arc<RuleIndex>,
    matcher: Matcher,
    enforcer: Enforcer,
    instances: Option<Arc<dyn TriggerInstanceStore>>,
    sinks: SinkSet,
    metrics: Option<MetricsCollector>,
    config: EngineConfig,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn EventQueue>,
        index: Arc<RuleIndex>,
        executor: Arc<dyn ActionExecutor>,
        store: Arc<dyn EnforcementStore>,
        config: EngineConfig,
    ) -> Self {
        let enforcer = Enforcer::new(executor, store, &config);
        Self {
            queue,
            index,
            matcher: Matcher::new(),
            enforcer,
            instances: None,
            sinks: SinkSet::new(),
            metrics: None,
            config,
        }
    }

    /// Track trigger instance status transitions
    pub fn with_instance_store(mut self, instances: Arc<dyn TriggerInstanceStore>) -> Self {
        self.instances = Some(instances);
        self
    }

    /// Publish outcome events to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sinks = self.sinks.with(sink);
        self
    }

    /// Count outcomes, retries and matching latency
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.enforcer = self.enforcer.with_metrics(metrics.clone());
        self.sinks = self.sinks.with(Arc::new(metrics.clone()));
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<RuleIndex> {
        &self.index
    }

    /// Run the worker pool until `cancel` fires or the queue closes.
    ///
    /// Workers stop pulling on cancellation; instances already pulled are
    /// processed and acked or nacked before this returns.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        if let Err(e) = self.index.refresh().await {
            warn!(error = %e, "Initial rule load failed, matching will retry");
        }

        let refresher_cancel = cancel.child_token();
        let refresher = Arc::clone(&self.index)
            .spawn_refresher(self.config.index_refresh_interval(), refresher_cancel.clone());

        info!(
            workers = self.config.workers,
            enforcement_concurrency = self.config.enforcement_concurrency,
            "Dispatcher started"
        );

        let mut workers = JoinSet::new();
        for worker in 0..self.config.workers {
            workers.spawn(Arc::clone(&self).worker_loop(worker, cancel.clone()));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }

        refresher_cancel.cancel();
        if let Err(e) = refresher.await {
            error!(error = %e, "Rule index refresher failed");
        }

        info!("Dispatcher stopped");
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        debug!(worker, "Worker started");
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = self.queue.receive() => received,
            };

            match received {
                Ok(Some(delivery)) => self.handle_delivery(delivery).await,
                Ok(None) => {
                    debug!(worker, "Event queue closed");
                    break;
                }
                Err(e) => {
                    warn!(worker, error = %e, "Failed to receive from event queue");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.redelivery_delay(1)) => {}
                    }
                }
            }
        }
        debug!(worker, "Worker stopped");
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let span = info_span!(
            "trigger_instance",
            id = %delivery.instance.id,
            trigger = %delivery.instance.trigger_type,
            attempt = delivery.attempt
        );
        let report = self.process(&delivery.instance).instrument(span).await;

        let settled = if report.is_done() {
            self.queue.ack(&delivery).await
        } else {
            let delay = self.config.redelivery_delay(delivery.attempt);
            self.queue.nack(&delivery, delay).await
        };

        if let Err(e) = settled {
            error!(
                trigger_instance = %delivery.instance.id,
                error = %e,
                "Failed to settle delivery"
            );
        }
    }

    /// Run one trigger instance through matching and enforcement
    pub async fn process(&self, instance: &TriggerInstance) -> InstanceReport {
        let mut report = InstanceReport::new(&instance.id);
        self.set_status(&instance.id, TriggerInstanceStatus::Processing)
            .await;

        report.state = InstanceState::Matching;
        let snapshot = match self.snapshot_with_retry().await {
            Ok(snapshot) => snapshot,
            Err(e) => return self.fail(report, e.to_string()).await,
        };
        report.snapshot_version = Some(snapshot.version());

        let started = Instant::now();
        let outcome = self.matcher.match_rules(instance, &snapshot);
        if let Some(metrics) = &self.metrics {
            metrics.record_match_latency(started.elapsed().as_micros() as u64);
        }

        report.state = InstanceState::Enforcing;
        debug!(
            snapshot = snapshot.version(),
            matched = outcome.matched.len(),
            skipped = outcome.skipped.len(),
            "Enforcing matched rules"
        );

        let mut failure: Option<String> = None;

        for skipped in &outcome.skipped {
            let record = RuleEnforcement::skipped(
                EnforcementKey::new(&instance.id, &skipped.rule.id),
                skipped.rule.reference(),
                &skipped.reason,
            );
            match self.enforcer.store().insert_if_absent(record).await {
                Ok(InsertOutcome::Inserted(record)) => {
                    self.publish_record(&record);
                    report.records.push(record);
                }
                Ok(InsertOutcome::Existing(record)) => report.records.push(record),
                Err(e) => {
                    error!(
                        rule = %skipped.rule.reference(),
                        error = %e,
                        "Failed to record skipped rule"
                    );
                    failure.get_or_insert_with(|| e.to_string());
                }
            }
        }

        let results: Vec<(Arc<Rule>, Result<EnforceOutcome>)> =
            stream::iter(outcome.matched.iter().cloned())
                .map(|rule| async move {
                    let result = self.enforcer.enforce_outcome(instance, &rule).await;
                    (rule, result)
                })
                .buffered(self.config.enforcement_concurrency)
                .collect()
                .await;

        for (rule, result) in results {
            match result {
                Ok(enforced) => {
                    if !enforced.replayed {
                        self.sinks.publish(&OutcomeEvent::matched(instance, &rule));
                        self.publish_record(&enforced.record);
                    }
                    report.records.push(enforced.record);
                }
                Err(e) => {
                    error!(rule = %rule.reference(), error = %e, "Enforcement store failure");
                    failure.get_or_insert_with(|| e.to_string());
                }
            }
        }

        if failure.is_none() {
            if let Some(pending) = report.records.iter().find(|r| !r.is_terminal()) {
                failure = Some(format!("enforcement {} still in progress", pending.key));
            }
        }

        match failure {
            Some(reason) => self.fail(report, reason).await,
            None => {
                self.set_status(&instance.id, TriggerInstanceStatus::Processed)
                    .await;
                self.sinks
                    .publish(&OutcomeEvent::instance_processed(&instance.id));
                report.state = InstanceState::Done;
                report
            }
        }
    }

    async fn snapshot_with_retry(&self) -> Result<Arc<RuleIndexSnapshot>> {
        let policy = &self.config.matching_retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.index.snapshot_or_refresh().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Rule index unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fail(&self, mut report: InstanceReport, reason: String) -> InstanceReport {
        self.set_status(&report.trigger_instance_id, TriggerInstanceStatus::ProcessingFailed)
            .await;
        self.sinks.publish(&OutcomeEvent::instance_failed(
            &report.trigger_instance_id,
            &reason,
        ));
        report.state = InstanceState::Failed;
        report.error = Some(reason);
        report
    }

    fn publish_record(&self, record: &RuleEnforcement) {
        if let Some(event) = OutcomeEvent::from_enforcement(record) {
            self.sinks.publish(&event);
        }
    }

    /// Status tracking is advisory; failures are logged, not escalated
    async fn set_status(&self, trigger_instance_id: &str, status: TriggerInstanceStatus) {
        let Some(instances) = &self.instances else {
            return;
        };
        match instances.set_status(trigger_instance_id, status).await {
            Ok(effective) if effective != status => debug!(
                requested = %status,
                effective = %effective,
                "Ignored backward status transition"
            ),
            Ok(_) => {}
            Err(e) => warn!(
                status = %status,
                error = %e,
                "Failed to update trigger instance status"
            ),
        }
    }
}
