//! In-memory rule repository

use async_trait::async_trait;
use parking_lot::RwLock;
use rulestream_core::{Error, Result, Rule, RuleChange, RuleRepository};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Rules held in registration order, with change notifications.
///
/// `set_available(false)` makes every read fail with
/// `RepositoryUnavailable`, which is how outages are simulated.
pub struct InMemoryRuleRepository {
    rules: RwLock<Vec<Rule>>,
    available: AtomicBool,
    changes: broadcast::Sender<RuleChange>,
}

impl InMemoryRuleRepository {
    pub fn new(rules: Vec<Rule>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            rules: RwLock::new(rules),
            available: AtomicBool::new(true),
            changes,
        }
    }

    /// Insert a rule or replace the one with the same id
    pub fn upsert(&self, rule: Rule) {
        let id = rule.id.clone();
        {
            let mut rules = self.rules.write();
            match rules.iter_mut().find(|r| r.id == id) {
                Some(existing) => *existing = rule,
                None => rules.push(rule),
            }
        }
        self.notify(RuleChange::Upserted(id));
    }

    pub fn remove(&self, rule_id: &str) -> bool {
        let removed = {
            let mut rules = self.rules.write();
            let before = rules.len();
            rules.retain(|r| r.id != rule_id);
            rules.len() != before
        };
        if removed {
            self.notify(RuleChange::Removed(rule_id.to_string()));
        }
        removed
    }

    /// Replace the whole rule set
    pub fn replace_all(&self, rules: Vec<Rule>) {
        *self.rules.write() = rules;
        self.notify(RuleChange::Reloaded);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    fn notify(&self, change: RuleChange) {
        // no subscribers is fine
        let _ = self.changes.send(change);
    }
}

impl Default for InMemoryRuleRepository {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::repository("in-memory repository marked unavailable"));
        }
        Ok(self
            .rules
            .read()
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect())
    }

    fn subscribe_to_changes(&self) -> Option<broadcast::Receiver<RuleChange>> {
        Some(self.changes.subscribe())
    }
}
