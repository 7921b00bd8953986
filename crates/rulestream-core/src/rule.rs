//! Rule definitions

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field path → predicate. All predicates must hold for a rule to match.
///
/// Iterates in field-path order, whatever order the document declared.
pub type Criteria = BTreeMap<String, Predicate>;

/// A declarative binding of a trigger type, criteria and an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule identifier
    #[serde(default = "generate_rule_id")]
    pub id: String,

    /// Pack (namespace) the rule belongs to
    #[serde(default = "default_pack")]
    pub pack: String,

    /// Rule name, unique within its pack
    pub name: String,

    /// Description of what this rule does
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Trigger type this rule listens to
    pub trigger: TriggerSpec,

    /// Conditions over the trigger payload
    #[serde(default)]
    pub criteria: Criteria,

    /// Action to enforce when the rule matches
    pub action: ActionSpec,

    /// Whether this rule is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Rule {
    /// Create an enabled rule with no criteria
    pub fn new(
        pack: impl Into<String>,
        name: impl Into<String>,
        trigger_type: impl Into<String>,
        action_ref: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_rule_id(),
            pack: pack.into(),
            name: name.into(),
            description: None,
            trigger: TriggerSpec {
                trigger_type: trigger_type.into(),
            },
            criteria: Criteria::new(),
            action: ActionSpec {
                action_ref: action_ref.into(),
                parameters: serde_json::Map::new(),
            },
            enabled: true,
            tags: Vec::new(),
        }
    }

    /// Set an explicit id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Add a predicate on a payload field
    pub fn with_criterion(mut self, field: impl Into<String>, predicate: Predicate) -> Self {
        self.criteria.insert(field.into(), predicate);
        self
    }

    /// Add an action parameter
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.action.parameters.insert(name.into(), value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// `pack.name` reference
    pub fn reference(&self) -> String {
        format!("{}.{}", self.pack, self.name)
    }

    pub fn trigger_type(&self) -> &str {
        &self.trigger.trigger_type
    }
}

/// Trigger a rule is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpec {
    #[serde(rename = "type")]
    pub trigger_type: String,
}

/// Action enforced for a matched rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Action reference, e.g. `core.local`
    #[serde(rename = "ref")]
    pub action_ref: String,

    /// Parameters; string leaves may contain template references
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
}

/// A single condition over one payload field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub operator: Operator,

    /// Expected value
    #[serde(default, alias = "pattern", skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// Cast both sides to this type before comparing
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<TypeHint>,
}

impl Predicate {
    pub fn new(operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            operator,
            value: Some(value.into()),
            type_hint: None,
        }
    }

    /// Predicate without an operand (`exists`, `nexists`, `changed_from_nothing`)
    pub fn unary(operator: Operator) -> Self {
        Self {
            operator,
            value: None,
            type_hint: None,
        }
    }

    pub fn with_type(mut self, type_hint: TypeHint) -> Self {
        self.type_hint = Some(type_hint);
        self
    }
}

/// Closed set of criteria operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "equals", alias = "eq")]
    Equals,
    #[serde(rename = "nequals", alias = "neq", alias = "not_equals")]
    NotEquals,
    #[serde(rename = "iequals")]
    IEquals,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "ncontains", alias = "not_contains")]
    NotContains,
    #[serde(rename = "icontains")]
    IContains,
    #[serde(rename = "incontains")]
    INotContains,
    #[serde(rename = "startswith")]
    StartsWith,
    #[serde(rename = "istartswith")]
    IStartsWith,
    #[serde(rename = "endswith")]
    EndsWith,
    #[serde(rename = "iendswith")]
    IEndsWith,
    #[serde(rename = "greaterthan", alias = "gt")]
    GreaterThan,
    #[serde(rename = "lessthan", alias = "lt")]
    LessThan,
    #[serde(rename = "regex", alias = "matchregex")]
    Regex,
    #[serde(rename = "iregex")]
    IRegex,
    #[serde(rename = "search_regex")]
    SearchRegex,
    #[serde(rename = "matchwildcard")]
    MatchWildcard,
    #[serde(rename = "inside")]
    Inside,
    #[serde(rename = "ninside")]
    NotInside,
    #[serde(rename = "timediff_lt")]
    TimeDiffLessThan,
    #[serde(rename = "timediff_gt")]
    TimeDiffGreaterThan,
    #[serde(rename = "exists")]
    Exists,
    #[serde(rename = "nexists", alias = "not_exists")]
    NotExists,
    #[serde(rename = "changed_from_nothing")]
    ChangedFromNothing,
}

impl Operator {
    /// Canonical operator name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "nequals",
            Self::IEquals => "iequals",
            Self::Contains => "contains",
            Self::NotContains => "ncontains",
            Self::IContains => "icontains",
            Self::INotContains => "incontains",
            Self::StartsWith => "startswith",
            Self::IStartsWith => "istartswith",
            Self::EndsWith => "endswith",
            Self::IEndsWith => "iendswith",
            Self::GreaterThan => "greaterthan",
            Self::LessThan => "lessthan",
            Self::Regex => "regex",
            Self::IRegex => "iregex",
            Self::SearchRegex => "search_regex",
            Self::MatchWildcard => "matchwildcard",
            Self::Inside => "inside",
            Self::NotInside => "ninside",
            Self::TimeDiffLessThan => "timediff_lt",
            Self::TimeDiffGreaterThan => "timediff_gt",
            Self::Exists => "exists",
            Self::NotExists => "nexists",
            Self::ChangedFromNothing => "changed_from_nothing",
        }
    }

    /// Whether the predicate must carry a value
    pub fn requires_operand(&self) -> bool {
        !matches!(
            self,
            Self::Exists | Self::NotExists | Self::ChangedFromNothing
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Type both sides of a comparison are cast to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeHint {
    #[serde(alias = "str")]
    String,
    #[serde(alias = "int")]
    Integer,
    #[serde(alias = "number", alias = "double")]
    Float,
    #[serde(alias = "bool")]
    Boolean,
}

impl fmt::Display for TypeHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => f.write_str("string"),
            Self::Integer => f.write_str("integer"),
            Self::Float => f.write_str("float"),
            Self::Boolean => f.write_str("boolean"),
        }
    }
}

fn generate_rule_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_pack() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}
