//! Metrics collection and reporting

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::events::{OutcomeEvent, OutcomeKind, OutcomeSink};

/// Metrics collector for rule matching and enforcement.
///
/// Keeps in-process counters for [`MetricsCollector::snapshot`] and mirrors
/// every count to the `metrics` facade for whichever exporter is installed.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    matched: AtomicU64,
    enforced: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    instances_processed: AtomicU64,
    instances_failed: AtomicU64,
    total_match_latency_us: AtomicU64,
    matches_timed: AtomicU64,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    /// Record how long matching one trigger instance took
    pub fn record_match_latency(&self, latency_us: u64) {
        self.inner
            .total_match_latency_us
            .fetch_add(latency_us, Ordering::Relaxed);
        self.inner.matches_timed.fetch_add(1, Ordering::Relaxed);
        metrics::histogram!("rulestream_match_latency_us").record(latency_us as f64);
    }

    /// Record a submission retry
    pub fn record_submission_retry(&self) {
        metrics::counter!("rulestream_submission_retries_total").increment(1);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            matched: self.inner.matched.load(Ordering::Relaxed),
            enforced: self.inner.enforced.load(Ordering::Relaxed),
            skipped: self.inner.skipped.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            instances_processed: self.inner.instances_processed.load(Ordering::Relaxed),
            instances_failed: self.inner.instances_failed.load(Ordering::Relaxed),
            total_match_latency_us: self.inner.total_match_latency_us.load(Ordering::Relaxed),
            matches_timed: self.inner.matches_timed.load(Ordering::Relaxed),
        }
    }
}

impl OutcomeSink for MetricsCollector {
    fn publish(&self, event: &OutcomeEvent) {
        let counter = match event.kind {
            OutcomeKind::Matched => &self.inner.matched,
            OutcomeKind::Enforced => &self.inner.enforced,
            OutcomeKind::Skipped => &self.inner.skipped,
            OutcomeKind::Failed => &self.inner.failed,
            OutcomeKind::InstanceProcessed => &self.inner.instances_processed,
            OutcomeKind::InstanceFailed => &self.inner.instances_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        match event.kind {
            OutcomeKind::InstanceProcessed => {
                metrics::counter!("rulestream_trigger_instances_total", "outcome" => "processed")
                    .increment(1)
            }
            OutcomeKind::InstanceFailed => {
                metrics::counter!("rulestream_trigger_instances_total", "outcome" => "failed")
                    .increment(1)
            }
            kind => metrics::counter!("rulestream_enforcements_total", "status" => kind.as_str())
                .increment(1),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of current metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub matched: u64,
    pub enforced: u64,
    pub skipped: u64,
    pub failed: u64,
    pub instances_processed: u64,
    pub instances_failed: u64,
    pub total_match_latency_us: u64,
    pub matches_timed: u64,
}

impl MetricsSnapshot {
    /// Calculate average matching latency per trigger instance
    pub fn avg_match_latency_us(&self) -> u64 {
        if self.matches_timed == 0 {
            0
        } else {
            self.total_match_latency_us / self.matches_timed
        }
    }

    /// Share of terminal rule outcomes that were enforced
    pub fn enforcement_rate(&self) -> f64 {
        let terminal = self.enforced + self.failed + self.skipped;
        if terminal == 0 {
            0.0
        } else {
            self.enforced as f64 / terminal as f64
        }
    }
}
