//! Action parameter rendering
//!
//! String parameters are minijinja templates evaluated against the trigger
//! instance. Non-string values are copied through; arrays and objects are
//! rendered recursively. References to missing payload fields render as
//! empty strings instead of failing.

use minijinja::{Environment, UndefinedBehavior};
use rulestream_core::{RenderError, Rule, TriggerInstance};
use serde::Serialize;
use serde_json::{Map, Value};

/// Data visible to parameter templates
#[derive(Debug, Clone, Serialize)]
pub struct TemplateContext<'a> {
    /// The trigger payload
    pub trigger: &'a Value,
    pub trigger_instance: InstanceContext<'a>,
    pub rule: RuleContext<'a>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceContext<'a> {
    pub id: &'a str,
    pub trigger_type: &'a str,
    pub occurred_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleContext<'a> {
    pub id: &'a str,
    #[serde(rename = "ref")]
    pub reference: String,
    pub pack: &'a str,
    pub name: &'a str,
}

impl<'a> TemplateContext<'a> {
    pub fn new(instance: &'a TriggerInstance, rule: &'a Rule) -> Self {
        Self {
            trigger: &instance.payload,
            trigger_instance: InstanceContext {
                id: &instance.id,
                trigger_type: &instance.trigger_type,
                occurred_at: instance.occurred_at.to_rfc3339(),
            },
            rule: RuleContext {
                id: &rule.id,
                reference: rule.reference(),
                pack: &rule.pack,
                name: &rule.name,
            },
        }
    }
}

/// Renders a rule's action parameters for one trigger instance.
///
/// Templates are arbitrary strings, so a fresh environment is built per
/// render call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterRenderer;

impl ParameterRenderer {
    pub fn new() -> Self {
        Self
    }

    fn build_env() -> Environment<'static> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env
    }

    pub fn render(
        &self,
        instance: &TriggerInstance,
        rule: &Rule,
    ) -> Result<Map<String, Value>, RenderError> {
        let env = Self::build_env();
        let context = TemplateContext::new(instance, rule);

        rule.action
            .parameters
            .iter()
            .map(|(name, value)| {
                let rendered = render_value(&env, name, value, &context)?;
                Ok((name.clone(), rendered))
            })
            .collect()
    }
}

fn render_value(
    env: &Environment<'_>,
    path: &str,
    value: &Value,
    context: &TemplateContext<'_>,
) -> Result<Value, RenderError> {
    match value {
        Value::String(source) if is_template(source) => env
            .render_str(source, context)
            .map(Value::String)
            .map_err(|e| RenderError::new(path, e.to_string())),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| render_value(env, &format!("{}[{}]", path, i), item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => fields
            .iter()
            .map(|(key, item)| {
                let rendered = render_value(env, &format!("{}.{}", path, key), item, context)?;
                Ok((key.clone(), rendered))
            })
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn is_template(source: &str) -> bool {
    source.contains("{{") || source.contains("{%")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance() -> TriggerInstance {
        TriggerInstance::new(
            "core.st2.generic",
            json!({"host": "web-1", "severity": 7, "tags": ["a", "b"]}),
        )
        .with_id("ti-42")
    }

    fn rule_with(params: Value) -> Rule {
        let mut rule = Rule::new("ops", "page", "core.st2.generic", "core.local").with_id("r-1");
        if let Value::Object(map) = params {
            rule.action.parameters = map;
        }
        rule
    }

    #[test]
    fn test_renders_payload_references() {
        let rule = rule_with(json!({
            "cmd": "echo {{ trigger.host }} is at {{ trigger.severity }}",
            "timeout": 30,
        }));
        let params = ParameterRenderer::new().render(&instance(), &rule).unwrap();

        assert_eq!(params["cmd"], json!("echo web-1 is at 7"));
        assert_eq!(params["timeout"], json!(30));
    }

    #[test]
    fn test_instance_and_rule_context() {
        let rule = rule_with(json!({
            "note": "{{ rule.ref }} fired for {{ trigger_instance.id }} ({{ trigger_instance.trigger_type }})",
        }));
        let params = ParameterRenderer::new().render(&instance(), &rule).unwrap();

        assert_eq!(params["note"], json!("ops.page fired for ti-42 (core.st2.generic)"));
    }

    #[test]
    fn test_missing_reference_renders_empty() {
        let rule = rule_with(json!({"msg": "[{{ trigger.nope.deeper }}]"}));
        let params = ParameterRenderer::new().render(&instance(), &rule).unwrap();

        assert_eq!(params["msg"], json!("[]"));
    }

    #[test]
    fn test_nested_values_are_rendered() {
        let rule = rule_with(json!({
            "env": {"HOST": "{{ trigger.host }}", "STATIC": "x"},
            "args": ["{{ trigger.tags[1] }}", 3],
        }));
        let params = ParameterRenderer::new().render(&instance(), &rule).unwrap();

        assert_eq!(params["env"], json!({"HOST": "web-1", "STATIC": "x"}));
        assert_eq!(params["args"], json!(["b", 3]));
    }

    #[test]
    fn test_syntax_error_names_parameter() {
        let rule = rule_with(json!({"env": {"HOST": "{{ trigger.host "}}));
        let err = ParameterRenderer::new().render(&instance(), &rule).unwrap_err();

        assert_eq!(err.parameter, "env.HOST");
        assert!(!err.reason.is_empty());
    }

    #[test]
    fn test_plain_strings_untouched() {
        let rule = rule_with(json!({"raw": "100% {literal}"}));
        let params = ParameterRenderer::new().render(&instance(), &rule).unwrap();
        assert_eq!(params["raw"], json!("100% {literal}"));
    }
}
