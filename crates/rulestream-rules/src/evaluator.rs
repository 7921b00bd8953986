//! Criteria evaluation
//!
//! A criteria map is a conjunction of predicates, each naming a payload
//! field path, an operator and an expected value. Evaluation is pure.
//!
//! Semantics:
//! - an empty criteria map matches
//! - an absent field only satisfies `nexists` (and fails `exists`)
//! - a payload value that cannot be cast for the comparison is a non-match
//! - a malformed predicate (missing value, bad regex, uncastable operand)
//!   is a [`CriteriaEvalError`], reported regardless of payload content

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::{Regex, RegexBuilder};
use rulestream_core::{Criteria, CriteriaEvalError, Operator, Predicate, TypeHint};
use serde_json::{Number, Value};
use std::borrow::Cow;
use std::cmp::Ordering;

use crate::path;

/// Stateless criteria interpreter
#[derive(Debug, Clone, Copy, Default)]
pub struct CriteriaEvaluator;

impl CriteriaEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate all predicates against `payload` (logical AND).
    ///
    /// Predicates run in field-path order. Every predicate is checked, so a
    /// malformed predicate is reported even when an earlier one already
    /// failed to match; with several malformed ones the first path wins.
    pub fn evaluate(&self, payload: &Value, criteria: &Criteria) -> Result<bool, CriteriaEvalError> {
        let mut matched = true;

        for (field, predicate) in criteria {
            if !self.evaluate_predicate(payload, field, predicate)? {
                matched = false;
            }
        }

        Ok(matched)
    }

    /// Evaluate a single predicate on `field`
    pub fn evaluate_predicate(
        &self,
        payload: &Value,
        field: &str,
        predicate: &Predicate,
    ) -> Result<bool, CriteriaEvalError> {
        let prepared = Prepared::new(field, predicate)?;

        let Some(actual) = path::resolve(payload, field) else {
            return Ok(predicate.operator == Operator::NotExists);
        };

        let actual = match (predicate.type_hint, uses_type_hint(predicate.operator)) {
            (Some(hint), true) if is_scalar(actual) => match cast(actual, hint) {
                Some(v) => Cow::Owned(v),
                None => return Ok(false),
            },
            _ => Cow::Borrowed(actual),
        };

        Ok(apply(predicate.operator, &actual, &prepared))
    }
}

/// Operand after validation and casting
enum Prepared {
    None,
    Value(Value),
    Text(String),
    Pattern(Regex),
    Seconds(f64),
}

impl Prepared {
    fn new(field: &str, predicate: &Predicate) -> Result<Self, CriteriaEvalError> {
        let op = predicate.operator;

        if !op.requires_operand() {
            return Ok(Self::None);
        }

        let raw = predicate
            .value
            .as_ref()
            .ok_or_else(|| CriteriaEvalError::MissingOperand {
                field: field.to_string(),
                operator: op,
            })?;

        let operand = match predicate.type_hint {
            Some(hint) => cast_operand(field, raw, hint)?,
            None => raw.clone(),
        };

        let invalid = |reason: &str| CriteriaEvalError::InvalidOperand {
            field: field.to_string(),
            operator: op,
            reason: reason.to_string(),
        };

        match op {
            Operator::Equals | Operator::NotEquals | Operator::Contains | Operator::NotContains => {
                Ok(Self::Value(operand))
            }

            Operator::GreaterThan | Operator::LessThan => {
                if is_scalar(&operand) && !operand.is_null() && !operand.is_boolean() {
                    Ok(Self::Value(operand))
                } else {
                    Err(invalid("expected a number or string"))
                }
            }

            Operator::Inside | Operator::NotInside => match operand {
                Value::Array(_) | Value::String(_) | Value::Object(_) => Ok(Self::Value(operand)),
                _ => Err(invalid("expected a list, string or mapping")),
            },

            Operator::IEquals
            | Operator::IContains
            | Operator::INotContains
            | Operator::StartsWith
            | Operator::IStartsWith
            | Operator::EndsWith
            | Operator::IEndsWith => text(&operand)
                .map(|t| Self::Text(t.into_owned()))
                .ok_or_else(|| invalid("expected a string")),

            Operator::Regex | Operator::IRegex | Operator::SearchRegex | Operator::MatchWildcard => {
                let pattern = text(&operand).ok_or_else(|| invalid("expected a pattern string"))?;
                let source = match op {
                    Operator::Regex | Operator::IRegex => format!("^(?:{})", pattern),
                    Operator::MatchWildcard => wildcard_to_regex(&pattern),
                    _ => pattern.to_string(),
                };

                RegexBuilder::new(&source)
                    .case_insensitive(op == Operator::IRegex)
                    .build()
                    .map(Self::Pattern)
                    .map_err(|e| CriteriaEvalError::InvalidRegex {
                        field: field.to_string(),
                        pattern: pattern.into_owned(),
                        reason: e.to_string(),
                    })
            }

            Operator::TimeDiffLessThan | Operator::TimeDiffGreaterThan => as_number(&operand)
                .filter(|s| s.is_finite())
                .map(Self::Seconds)
                .ok_or_else(|| invalid("expected a number of seconds")),

            Operator::Exists | Operator::NotExists | Operator::ChangedFromNothing => Ok(Self::None),
        }
    }
}

/// Operator table, applied to a present payload value
fn apply(op: Operator, actual: &Value, prepared: &Prepared) -> bool {
    match (op, prepared) {
        (Operator::Exists, _) => true,
        (Operator::NotExists, _) => false,
        (Operator::ChangedFromNothing, _) => !is_empty(actual),

        (Operator::Equals, Prepared::Value(expected)) => values_equal(actual, expected),
        (Operator::NotEquals, Prepared::Value(expected)) => !values_equal(actual, expected),

        (Operator::Contains, Prepared::Value(expected)) => contains(actual, expected).unwrap_or(false),
        (Operator::NotContains, Prepared::Value(expected)) => {
            contains(actual, expected).map(|c| !c).unwrap_or(false)
        }

        (Operator::GreaterThan, Prepared::Value(expected)) => {
            compare(actual, expected) == Some(Ordering::Greater)
        }
        (Operator::LessThan, Prepared::Value(expected)) => {
            compare(actual, expected) == Some(Ordering::Less)
        }

        (Operator::Inside, Prepared::Value(container)) => contains(container, actual).unwrap_or(false),
        (Operator::NotInside, Prepared::Value(container)) => {
            contains(container, actual).map(|c| !c).unwrap_or(false)
        }

        (Operator::IEquals, Prepared::Text(expected)) => {
            text_op(actual, |a| a.to_lowercase() == expected.to_lowercase())
        }
        (Operator::IContains, Prepared::Text(expected)) => {
            text_op(actual, |a| a.to_lowercase().contains(&expected.to_lowercase()))
        }
        (Operator::INotContains, Prepared::Text(expected)) => {
            text_op(actual, |a| !a.to_lowercase().contains(&expected.to_lowercase()))
        }
        (Operator::StartsWith, Prepared::Text(expected)) => text_op(actual, |a| a.starts_with(expected.as_str())),
        (Operator::IStartsWith, Prepared::Text(expected)) => {
            text_op(actual, |a| a.to_lowercase().starts_with(&expected.to_lowercase()))
        }
        (Operator::EndsWith, Prepared::Text(expected)) => text_op(actual, |a| a.ends_with(expected.as_str())),
        (Operator::IEndsWith, Prepared::Text(expected)) => {
            text_op(actual, |a| a.to_lowercase().ends_with(&expected.to_lowercase()))
        }

        (
            Operator::Regex | Operator::IRegex | Operator::SearchRegex | Operator::MatchWildcard,
            Prepared::Pattern(re),
        ) => text_op(actual, |a| re.is_match(a)),

        (Operator::TimeDiffLessThan, Prepared::Seconds(limit)) => {
            seconds_since(actual).map(|s| s < *limit).unwrap_or(false)
        }
        (Operator::TimeDiffGreaterThan, Prepared::Seconds(limit)) => {
            seconds_since(actual).map(|s| s > *limit).unwrap_or(false)
        }

        _ => false,
    }
}

fn uses_type_hint(op: Operator) -> bool {
    !matches!(
        op,
        Operator::Exists | Operator::NotExists | Operator::ChangedFromNothing
    )
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn text(value: &Value) -> Option<Cow<'_, str>> {
    match value {
        Value::String(s) => Some(Cow::Borrowed(s.as_str())),
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        Value::Bool(b) => Some(Cow::Owned(b.to_string())),
        _ => None,
    }
}

fn text_op(value: &Value, f: impl FnOnce(&str) -> bool) -> bool {
    text(value).map(|t| f(&t)).unwrap_or(false)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Equality with best-effort coercion between numbers, booleans and strings
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            s.trim().parse::<f64>().ok() == n.as_f64()
        }
        (Value::Bool(x), Value::String(s)) | (Value::String(s), Value::Bool(x)) => {
            parse_bool(s) == Some(*x)
        }
        _ => a == b,
    }
}

/// Membership test; `None` when `container` cannot contain anything
fn contains(container: &Value, item: &Value) -> Option<bool> {
    match container {
        Value::String(s) => text(item).map(|needle| s.contains(needle.as_ref())),
        Value::Array(items) => Some(items.iter().any(|v| values_equal(v, item))),
        Value::Object(map) => Some(text(item).map(|k| map.contains_key(k.as_ref())).unwrap_or(false)),
        _ => None,
    }
}

/// Numeric ordering when both sides read as numbers, else string ordering
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }

    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            DateTime::from_timestamp_millis((secs * 1000.0) as i64)
        }
        _ => None,
    }
}

fn seconds_since(value: &Value) -> Option<f64> {
    let ts = parse_timestamp(value)?;
    Some((Utc::now() - ts).num_milliseconds() as f64 / 1000.0)
}

fn wildcard_to_regex(pattern: &str) -> String {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');
    source
}

/// Cast a scalar payload value to `hint`
pub(crate) fn cast(value: &Value, hint: TypeHint) -> Option<Value> {
    match hint {
        TypeHint::String => text(value).map(|t| Value::String(t.into_owned())),
        TypeHint::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Value::from),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| {
                        s.parse::<f64>()
                            .ok()
                            .filter(|f| f.fract() == 0.0)
                            .map(|f| f as i64)
                    })
                    .map(Value::from)
            }
            _ => None,
        },
        TypeHint::Float => as_number(value)
            .and_then(Number::from_f64)
            .map(Value::Number),
        TypeHint::Boolean => match value {
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::String(s) => parse_bool(s).map(Value::Bool),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Some(Value::Bool(false)),
                Some(1) => Some(Value::Bool(true)),
                _ => None,
            },
            _ => None,
        },
    }
}

fn cast_operand(field: &str, raw: &Value, hint: TypeHint) -> Result<Value, CriteriaEvalError> {
    let uncastable = || CriteriaEvalError::UncastableOperand {
        field: field.to_string(),
        type_hint: hint,
        value: raw.to_string(),
    };

    match raw {
        Value::Array(items) => items
            .iter()
            .map(|item| cast(item, hint).ok_or_else(uncastable))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(_) => Ok(raw.clone()),
        _ => cast(raw, hint).ok_or_else(uncastable),
    }
}
