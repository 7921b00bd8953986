//! Property tests for matching determinism

use proptest::prelude::*;
use rulestream_core::{Operator, Predicate, Rule, TriggerInstance};
use rulestream_rules::{Matcher, RuleIndexSnapshot};
use serde_json::{json, Value};

const TRIGGER: &str = "core.st2.generic";

fn operator_strategy() -> impl Strategy<Value = Operator> {
    prop_oneof![
        Just(Operator::Equals),
        Just(Operator::NotEquals),
        Just(Operator::GreaterThan),
        Just(Operator::LessThan),
        Just(Operator::Contains),
        Just(Operator::Regex),
        Just(Operator::Exists),
        Just(Operator::NotExists),
    ]
}

fn rule_strategy() -> impl Strategy<Value = (String, Operator, i64, bool)> {
    (
        prop_oneof![Just("count"), Just("label"), Just("missing"), Just("nested.level")],
        operator_strategy(),
        -5i64..15,
        any::<bool>(),
    )
        .prop_map(|(field, op, value, enabled)| (field.to_string(), op, value, enabled))
}

fn build_rules(specs: &[(String, Operator, i64, bool)]) -> Vec<Rule> {
    specs
        .iter()
        .enumerate()
        .map(|(i, (field, op, value, enabled))| {
            let predicate = if op.requires_operand() {
                Predicate::new(*op, *value)
            } else {
                Predicate::unary(*op)
            };
            let rule = Rule::new("prop", format!("r{}", i), TRIGGER, "core.noop")
                .with_id(format!("r{}", i))
                .with_criterion(field.clone(), predicate);
            if *enabled {
                rule
            } else {
                rule.disabled()
            }
        })
        .collect()
}

fn payload(count: i64, label: &str) -> Value {
    json!({"count": count, "label": label, "nested": {"level": count % 3}})
}

proptest! {
    #[test]
    fn matching_is_deterministic_and_order_stable(
        specs in prop::collection::vec(rule_strategy(), 0..12),
        count in -10i64..20,
        label in "[a-z0-9]{0,6}",
    ) {
        let rules = build_rules(&specs);
        let registration: Vec<String> = rules.iter().filter(|r| r.enabled).map(|r| r.id.clone()).collect();
        let snapshot = RuleIndexSnapshot::build(7, rules);
        let instance = TriggerInstance::new(TRIGGER, payload(count, &label));
        let matcher = Matcher::new();

        let first = matcher.match_rules(&instance, &snapshot);
        let second = matcher.match_rules(&instance, &snapshot);

        let first_ids: Vec<_> = first.matched.iter().map(|r| r.id.clone()).collect();
        let second_ids: Vec<_> = second.matched.iter().map(|r| r.id.clone()).collect();
        prop_assert_eq!(&first_ids, &second_ids);

        // matched rules appear in registration order
        let positions: Vec<usize> = first_ids
            .iter()
            .map(|id| registration.iter().position(|r| r == id).unwrap())
            .collect();
        prop_assert!(positions.windows(2).all(|w| w[0] < w[1]));

        // nothing is both matched and skipped, and nothing disabled matches
        for skipped in &first.skipped {
            prop_assert!(!first_ids.contains(&skipped.rule.id));
        }
        prop_assert!(first.matched.iter().all(|r| r.enabled));
    }
}
