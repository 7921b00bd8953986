//! Rule index
//!
//! Groups enabled rules by trigger type. Each load produces an immutable,
//! versioned [`RuleIndexSnapshot`]; a refresh swaps the active snapshot in a
//! single pointer store, so matching always runs against one consistent view.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rulestream_core::{Error, Result, Rule, RuleChange, RuleRepository};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Immutable point-in-time view of the active rule set
#[derive(Debug)]
pub struct RuleIndexSnapshot {
    version: u64,
    loaded_at: DateTime<Utc>,
    by_trigger: HashMap<String, Vec<Arc<Rule>>>,
    rule_count: usize,
}

impl RuleIndexSnapshot {
    /// Build a snapshot from rules in registration order.
    /// Disabled rules are left out.
    pub fn build(version: u64, rules: Vec<Rule>) -> Self {
        let mut by_trigger: HashMap<String, Vec<Arc<Rule>>> = HashMap::new();
        let mut rule_count = 0;

        for rule in rules.into_iter().filter(|r| r.enabled) {
            rule_count += 1;
            by_trigger
                .entry(rule.trigger_type().to_string())
                .or_default()
                .push(Arc::new(rule));
        }

        Self {
            version,
            loaded_at: Utc::now(),
            by_trigger,
            rule_count,
        }
    }

    /// Candidate rules for a trigger type, in registration order
    pub fn rules_for(&self, trigger_type: &str) -> &[Arc<Rule>] {
        self.by_trigger
            .get(trigger_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Number of indexed rules
    pub fn len(&self) -> usize {
        self.rule_count
    }

    pub fn is_empty(&self) -> bool {
        self.rule_count == 0
    }

    pub fn trigger_types(&self) -> impl Iterator<Item = &str> {
        self.by_trigger.keys().map(String::as_str)
    }
}

/// Owner of the active rule snapshot
pub struct RuleIndex {
    repository: Arc<dyn RuleRepository>,
    current: RwLock<Option<Arc<RuleIndexSnapshot>>>,
    next_version: AtomicU64,
}

impl RuleIndex {
    /// Create an index; nothing is loaded until [`RuleIndex::refresh`]
    pub fn new(repository: Arc<dyn RuleRepository>) -> Self {
        Self {
            repository,
            current: RwLock::new(None),
            next_version: AtomicU64::new(1),
        }
    }

    /// The active snapshot.
    ///
    /// Fails with `RepositoryUnavailable` until a load has succeeded.
    pub fn snapshot(&self) -> Result<Arc<RuleIndexSnapshot>> {
        self.current
            .read()
            .clone()
            .ok_or_else(|| Error::repository("rule index has not been loaded"))
    }

    /// The active snapshot, loading one first if none exists yet
    pub async fn snapshot_or_refresh(&self) -> Result<Arc<RuleIndexSnapshot>> {
        match self.snapshot() {
            Ok(snapshot) => Ok(snapshot),
            Err(_) => self.refresh().await,
        }
    }

    /// Reload from the repository and swap the active snapshot.
    ///
    /// On failure the previous snapshot stays active.
    pub async fn refresh(&self) -> Result<Arc<RuleIndexSnapshot>> {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let rules = self.repository.list_enabled_rules().await?;
        let snapshot = Arc::new(RuleIndexSnapshot::build(version, rules));

        let mut current = self.current.write();
        if let Some(active) = current.as_ref() {
            // a slower, older refresh must not replace a newer one
            if active.version() > version {
                return Ok(Arc::clone(active));
            }
        }

        debug!(version, rules = snapshot.len(), "Swapped rule index snapshot");
        *current = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Refresh on every `interval` tick and on repository change
    /// notifications until `cancel` fires
    pub fn spawn_refresher(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut changes = self.repository.subscribe_to_changes();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            info!(
                interval_ms = interval.as_millis() as u64,
                notifications = changes.is_some(),
                "Rule index refresher started"
            );

            loop {
                let reason = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => "interval",
                    change = next_change(&mut changes) => match change {
                        Some(RuleChange::Upserted(_)) | Some(RuleChange::Removed(_)) => "rule changed",
                        Some(RuleChange::Reloaded) => "reloaded",
                        None => continue,
                    },
                };

                match self.refresh().await {
                    Ok(snapshot) => debug!(
                        reason,
                        version = snapshot.version(),
                        rules = snapshot.len(),
                        "Rule index refreshed"
                    ),
                    Err(e) => warn!(reason, error = %e, "Rule index refresh failed, keeping previous snapshot"),
                }
            }

            info!("Rule index refresher stopped");
        })
    }
}

/// Next change notification. A lagged receiver is reported as a full
/// reload; a closed channel stops notifications and pends forever.
async fn next_change(
    changes: &mut Option<broadcast::Receiver<RuleChange>>,
) -> Option<RuleChange> {
    let Some(rx) = changes.as_mut() else {
        return std::future::pending().await;
    };

    match rx.recv().await {
        Ok(change) => Some(change),
        Err(broadcast::error::RecvError::Lagged(_)) => Some(RuleChange::Reloaded),
        Err(broadcast::error::RecvError::Closed) => {
            *changes = None;
            None
        }
    }
}
