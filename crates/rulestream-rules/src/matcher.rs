//! Trigger instance → matched rules

use rulestream_core::{Rule, TriggerInstance};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::evaluator::CriteriaEvaluator;
use crate::index::RuleIndexSnapshot;

/// A rule whose criteria could not be evaluated
#[derive(Debug, Clone)]
pub struct SkippedRule {
    pub rule: Arc<Rule>,
    pub reason: String,
}

/// Result of matching one trigger instance against one snapshot
#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    /// Version of the snapshot that was used
    pub snapshot_version: u64,

    /// Matched rules, in snapshot order
    pub matched: Vec<Arc<Rule>>,

    /// Rules excluded because evaluation failed
    pub skipped: Vec<SkippedRule>,

    /// Number of candidate rules considered
    pub candidates: usize,
}

impl MatchOutcome {
    pub fn is_empty(&self) -> bool {
        self.matched.is_empty() && self.skipped.is_empty()
    }
}

/// Matches trigger instances against rule snapshots
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    evaluator: CriteriaEvaluator,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate every candidate rule for the instance's trigger type.
    ///
    /// A rule whose criteria fail to evaluate is reported in `skipped` and
    /// does not affect the other candidates.
    pub fn match_rules(
        &self,
        instance: &TriggerInstance,
        snapshot: &RuleIndexSnapshot,
    ) -> MatchOutcome {
        let candidates = snapshot.rules_for(&instance.trigger_type);
        let mut outcome = MatchOutcome {
            snapshot_version: snapshot.version(),
            candidates: candidates.len(),
            ..Default::default()
        };

        for rule in candidates.iter().filter(|r| r.enabled) {
            match self.evaluator.evaluate(&instance.payload, &rule.criteria) {
                Ok(true) => {
                    debug!(
                        trigger_instance = %instance.id,
                        rule = %rule.reference(),
                        "Rule matched"
                    );
                    outcome.matched.push(Arc::clone(rule));
                }
                Ok(false) => {
                    debug!(
                        trigger_instance = %instance.id,
                        rule = %rule.reference(),
                        "Rule did not match"
                    );
                }
                Err(e) => {
                    warn!(
                        trigger_instance = %instance.id,
                        rule = %rule.reference(),
                        error = %e,
                        "Skipping rule with invalid criteria"
                    );
                    outcome.skipped.push(SkippedRule {
                        rule: Arc::clone(rule),
                        reason: e.to_string(),
                    });
                }
            }
        }

        outcome
    }
}
