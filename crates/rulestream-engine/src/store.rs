//! In-memory enforcement and trigger instance stores

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rulestream_core::{
    EnforcementKey, EnforcementStatus, EnforcementStore, FinalizeOutcome, InsertOutcome, Result,
    RuleEnforcement, TriggerInstanceStatus, TriggerInstanceStore,
};
use std::collections::{BTreeMap, HashMap};

/// Enforcement records in a single ordered map.
///
/// Every operation runs under one lock, which makes insert-if-absent,
/// reclaim and finalize atomic with respect to each other.
#[derive(Debug, Default)]
pub struct InMemoryEnforcementStore {
    records: Mutex<BTreeMap<EnforcementKey, RuleEnforcement>>,
}

impl InMemoryEnforcementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Copy of every record, ordered by key
    pub fn records(&self) -> Vec<RuleEnforcement> {
        self.records.lock().values().cloned().collect()
    }

    pub fn count_with_status(&self, status: EnforcementStatus) -> usize {
        self.records
            .lock()
            .values()
            .filter(|r| r.status == status)
            .count()
    }
}

#[async_trait]
impl EnforcementStore for InMemoryEnforcementStore {
    async fn insert_if_absent(&self, record: RuleEnforcement) -> Result<InsertOutcome> {
        let mut records = self.records.lock();
        if let Some(existing) = records.get(&record.key) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        records.insert(record.key.clone(), record.clone());
        Ok(InsertOutcome::Inserted(record))
    }

    async fn get(&self, key: &EnforcementKey) -> Result<Option<RuleEnforcement>> {
        Ok(self.records.lock().get(key).cloned())
    }

    async fn reclaim_stale(
        &self,
        key: &EnforcementKey,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<RuleEnforcement>> {
        let mut records = self.records.lock();
        match records.get_mut(key) {
            Some(record) if !record.is_terminal() && record.claimed_at < stale_before => {
                // claimed_at is the owner token and must change hands
                let now = Utc::now().max(record.claimed_at + chrono::Duration::microseconds(1));
                record.claimed_at = now;
                record.updated_at = now;
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn finalize(&self, record: RuleEnforcement) -> Result<FinalizeOutcome> {
        let mut records = self.records.lock();
        match records.get(&record.key) {
            Some(existing) if existing.is_terminal() => {
                return Ok(FinalizeOutcome::AlreadyFinal(existing.clone()));
            }
            Some(existing) if existing.claimed_at != record.claimed_at => {
                return Ok(FinalizeOutcome::ClaimLost(existing.clone()));
            }
            _ => {}
        }
        records.insert(record.key.clone(), record.clone());
        Ok(FinalizeOutcome::Finalized(record))
    }

    async fn list_for_trigger_instance(
        &self,
        trigger_instance_id: &str,
    ) -> Result<Vec<RuleEnforcement>> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.key.trigger_instance_id == trigger_instance_id)
            .cloned()
            .collect())
    }
}

/// Trigger instance statuses; unknown instances count as `Received`
#[derive(Debug, Default)]
pub struct InMemoryTriggerInstanceStore {
    statuses: Mutex<HashMap<String, TriggerInstanceStatus>>,
}

impl InMemoryTriggerInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TriggerInstanceStore for InMemoryTriggerInstanceStore {
    async fn set_status(
        &self,
        trigger_instance_id: &str,
        status: TriggerInstanceStatus,
    ) -> Result<TriggerInstanceStatus> {
        let mut statuses = self.statuses.lock();
        let current = statuses
            .entry(trigger_instance_id.to_string())
            .or_insert(TriggerInstanceStatus::Received);
        if current.can_transition_to(status) {
            *current = status;
        }
        Ok(*current)
    }

    async fn status(&self, trigger_instance_id: &str) -> Result<Option<TriggerInstanceStatus>> {
        Ok(self.statuses.lock().get(trigger_instance_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(rule: &str) -> EnforcementKey {
        EnforcementKey::new("ti-1", rule)
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first() {
        let store = InMemoryEnforcementStore::new();
        let first = RuleEnforcement::claim(key("r1"), "ops.a");

        let outcome = store.insert_if_absent(first.clone()).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted(first.clone()));

        let second = RuleEnforcement::skipped(key("r1"), "ops.a", "late");
        match store.insert_if_absent(second).await.unwrap() {
            InsertOutcome::Existing(existing) => assert_eq!(existing, first),
            other => panic!("expected existing record, got {:?}", other),
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_never_overwrites_terminal() {
        let store = InMemoryEnforcementStore::new();
        let claim = RuleEnforcement::claim(key("r1"), "ops.a");
        store.insert_if_absent(claim.clone()).await.unwrap();

        let enforced = store
            .finalize(claim.clone().into_enforced("exec-1", 1))
            .await
            .unwrap();
        assert!(enforced.is_finalized());
        assert_eq!(enforced.record().status, EnforcementStatus::Enforced);

        match store.finalize(claim.into_failed("late", 3)).await.unwrap() {
            FinalizeOutcome::AlreadyFinal(again) => {
                assert_eq!(again.status, EnforcementStatus::Enforced);
                assert_eq!(again.execution_id.as_deref(), Some("exec-1"));
            }
            other => panic!("expected already final, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_finalize_rejects_taken_over_claim() {
        let store = InMemoryEnforcementStore::new();
        let mut claim = RuleEnforcement::claim(key("r1"), "ops.a");
        claim.claimed_at = Utc::now() - Duration::hours(1);
        store.insert_if_absent(claim.clone()).await.unwrap();

        let taken_over = store
            .reclaim_stale(&claim.key, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(taken_over.claimed_at, claim.claimed_at);

        // the slow first owner finishes after losing its claim
        match store.finalize(claim.into_enforced("exec-1", 1)).await.unwrap() {
            FinalizeOutcome::ClaimLost(current) => {
                assert_eq!(current.status, EnforcementStatus::Matched);
                assert_eq!(current.claimed_at, taken_over.claimed_at);
            }
            other => panic!("expected lost claim, got {:?}", other),
        }
        assert_eq!(store.count_with_status(EnforcementStatus::Matched), 1);

        let finished = store
            .finalize(taken_over.into_enforced("exec-2", 1))
            .await
            .unwrap();
        assert!(finished.is_finalized());
        assert_eq!(finished.record().execution_id.as_deref(), Some("exec-2"));
    }

    #[tokio::test]
    async fn test_reclaim_only_stale_claims() {
        let store = InMemoryEnforcementStore::new();
        let claim = RuleEnforcement::claim(key("r1"), "ops.a");
        store.insert_if_absent(claim.clone()).await.unwrap();

        let fresh_cutoff = claim.claimed_at - Duration::seconds(60);
        assert!(store.reclaim_stale(&claim.key, fresh_cutoff).await.unwrap().is_none());

        let stale_cutoff = claim.claimed_at + Duration::seconds(1);
        let reclaimed = store.reclaim_stale(&claim.key, stale_cutoff).await.unwrap().unwrap();
        assert!(reclaimed.claimed_at >= claim.claimed_at);
        assert!(!reclaimed.is_terminal());

        let finished = store.finalize(reclaimed.into_enforced("exec-1", 1)).await.unwrap();
        assert!(finished.is_finalized());
        let later = Utc::now() + Duration::seconds(600);
        assert!(store.reclaim_stale(&claim.key, later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_for_trigger_instance() {
        let store = InMemoryEnforcementStore::new();
        for rule in ["r2", "r1"] {
            store
                .insert_if_absent(RuleEnforcement::claim(key(rule), "ops.a"))
                .await
                .unwrap();
        }
        store
            .insert_if_absent(RuleEnforcement::claim(EnforcementKey::new("ti-2", "r1"), "ops.a"))
            .await
            .unwrap();

        let records = store.list_for_trigger_instance("ti-1").await.unwrap();
        let rules: Vec<_> = records.iter().map(|r| r.key.rule_id.as_str()).collect();
        assert_eq!(rules, vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_status_only_moves_forward() {
        let store = InMemoryTriggerInstanceStore::new();
        assert_eq!(store.status("ti-1").await.unwrap(), None);

        let s = store
            .set_status("ti-1", TriggerInstanceStatus::Processing)
            .await
            .unwrap();
        assert_eq!(s, TriggerInstanceStatus::Processing);

        let s = store
            .set_status("ti-1", TriggerInstanceStatus::ProcessingFailed)
            .await
            .unwrap();
        assert_eq!(s, TriggerInstanceStatus::ProcessingFailed);

        // redelivery moves back to processing: ignored
        let s = store
            .set_status("ti-1", TriggerInstanceStatus::Processing)
            .await
            .unwrap();
        assert_eq!(s, TriggerInstanceStatus::ProcessingFailed);

        let s = store
            .set_status("ti-1", TriggerInstanceStatus::Processed)
            .await
            .unwrap();
        assert_eq!(s, TriggerInstanceStatus::Processed);
    }
}
