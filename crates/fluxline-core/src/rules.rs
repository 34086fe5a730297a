//! Rules, rule sets, and condition evaluation
//!
//! A rule binds a prioritized condition set to a list of transforms. A rule
//! set is an ordered collection of rules plus an execution strategy that
//! decides which matching rules are applied.
//!
//! # Example
//!
//! ```yaml
//! name: order_routing
//! strategy: first_match
//! rules:
//!   - id: high_value
//!     priority: 10
//!     conditions:
//!       - type: field_value
//!         field: amount
//!         operator: greater_than
//!         value: 1000
//!     transforms:
//!       - add_fields:
//!           tier: premium
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::TransformationContext;
use crate::error::Result;
use crate::expr;
use crate::record::DataRecord;
use crate::transforms::Transform;

/// Comparison operator for field-value conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    /// Value equals the expected value
    Equals,
    /// Value differs from the expected value
    NotEquals,
    /// Numeric greater-than
    GreaterThan,
    /// Numeric greater-than-or-equal
    GreaterThanOrEqual,
    /// Numeric less-than
    LessThan,
    /// Numeric less-than-or-equal
    LessThanOrEqual,
    /// String or array containment
    Contains,
    /// String prefix match
    StartsWith,
    /// String suffix match
    EndsWith,
    /// Regex match against the string form of the value
    Matches,
    /// Field is absent or null
    IsNull,
    /// Field is present and non-null
    IsNotNull,
    /// Field is null, an empty string, or an empty array
    IsEmpty,
    /// Negation of `IsEmpty`
    IsNotEmpty,
    /// Value is one of the expected array's elements
    In,
    /// Value is not one of the expected array's elements
    NotIn,
}

/// Expected JSON type for field-type conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// JSON string
    Text,
    /// JSON number
    Number,
    /// JSON boolean
    Boolean,
    /// JSON array
    Array,
    /// JSON object
    Object,
    /// JSON null
    Null,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Text => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Null => value.is_null(),
        }
    }
}

/// A single evaluable condition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Compare a field's value against an expected value
    FieldValue {
        /// Field to read
        field: String,
        /// Comparison operator
        operator: ComparisonOperator,
        /// Expected value; unused by unary operators like `is_null`
        #[serde(default)]
        value: Option<Value>,
    },

    /// The named field exists on the record (null counts as existing)
    FieldExists {
        /// Field to check
        field: String,
    },

    /// The named field has the expected JSON type
    FieldType {
        /// Field to check
        field: String,
        /// Expected type
        expected: FieldKind,
    },

    /// Compare the number of records processed so far
    RecordCount {
        /// Comparison operator (numeric operators only are meaningful)
        operator: ComparisonOperator,
        /// Expected count
        value: u64,
    },

    /// Free-form Jinja expression over record fields and `vars`
    Expression {
        /// Expression source
        expression: String,
    },

    /// Always true
    Always,

    /// Always false
    Never,
}

impl Condition {
    /// Evaluate this condition against a record and the execution context
    pub fn evaluate(&self, record: &DataRecord, ctx: &TransformationContext) -> Result<bool> {
        match self {
            Self::FieldValue {
                field,
                operator,
                value,
            } => compare(record.get(field), *operator, value.as_ref()),
            Self::FieldExists { field } => Ok(record.contains(field)),
            Self::FieldType { field, expected } => Ok(record
                .get(field)
                .map(|v| expected.matches(v))
                .unwrap_or(false)),
            Self::RecordCount { operator, value } => compare(
                Some(&Value::from(ctx.stats.records_processed)),
                *operator,
                Some(&Value::from(*value)),
            ),
            Self::Expression { expression } => {
                expr::evaluate_bool(expression, record, &ctx.variables)
            }
            Self::Always => Ok(true),
            Self::Never => Ok(false),
        }
    }

    /// Whether evaluation depends only on the record itself.
    ///
    /// Record-count conditions read execution statistics and therefore make
    /// a transform ineligible for parallel batch processing.
    pub fn is_record_local(&self) -> bool {
        !matches!(self, Self::RecordCount { .. })
    }
}

fn compare(
    actual: Option<&Value>,
    operator: ComparisonOperator,
    expected: Option<&Value>,
) -> Result<bool> {
    use ComparisonOperator::*;

    // Unary operators first; they ignore the expected value.
    match operator {
        IsNull => return Ok(actual.map(Value::is_null).unwrap_or(true)),
        IsNotNull => return Ok(actual.map(|v| !v.is_null()).unwrap_or(false)),
        IsEmpty => return Ok(is_empty(actual)),
        IsNotEmpty => return Ok(!is_empty(actual)),
        _ => {}
    }

    let (Some(actual), Some(expected)) = (actual, expected) else {
        return Ok(false);
    };

    let result = match operator {
        Equals => values_equal(actual, expected),
        NotEquals => !values_equal(actual, expected),
        GreaterThan | GreaterThanOrEqual | LessThan | LessThanOrEqual => {
            match numeric_pair(actual, expected) {
                Some((a, b)) => match operator {
                    GreaterThan => a > b,
                    GreaterThanOrEqual => a >= b,
                    LessThan => a < b,
                    LessThanOrEqual => a <= b,
                    _ => unreachable!(),
                },
                // Fall back to lexicographic comparison for strings.
                None => match (actual.as_str(), expected.as_str()) {
                    (Some(a), Some(b)) => match operator {
                        GreaterThan => a > b,
                        GreaterThanOrEqual => a >= b,
                        LessThan => a < b,
                        LessThanOrEqual => a <= b,
                        _ => unreachable!(),
                    },
                    _ => false,
                },
            }
        }
        Contains => match actual {
            Value::String(s) => expected.as_str().map(|e| s.contains(e)).unwrap_or(false),
            Value::Array(items) => items.iter().any(|v| values_equal(v, expected)),
            _ => false,
        },
        StartsWith => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(e)) => a.starts_with(e),
            _ => false,
        },
        EndsWith => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(e)) => a.ends_with(e),
            _ => false,
        },
        Matches => match expected.as_str() {
            Some(pattern) => Regex::new(pattern)?.is_match(&text_of(actual)),
            // A non-string pattern is a config mistake; never match.
            None => false,
        },
        In => expected
            .as_array()
            .map(|items| items.iter().any(|v| values_equal(actual, v)))
            .unwrap_or(false),
        NotIn => expected
            .as_array()
            .map(|items| !items.iter().any(|v| values_equal(actual, v)))
            .unwrap_or(true),
        IsNull | IsNotNull | IsEmpty | IsNotEmpty => unreachable!(),
    };
    Ok(result)
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

/// Equality that treats numerically equal values as equal (1 == 1.0)
fn values_equal(a: &Value, b: &Value) -> bool {
    if let Some((x, y)) = numeric_pair(a, b) {
        return x == y;
    }
    a == b
}

fn numeric_pair(a: &Value, b: &Value) -> Option<(f64, f64)> {
    Some((a.as_f64()?, b.as_f64()?))
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// How multiple conditions on one rule combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionCombinator {
    /// Every condition must hold (logical AND)
    #[default]
    All,
    /// At least one condition must hold (logical OR)
    Any,
}

/// A named, prioritized condition-set bound to a list of transforms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Rule id (unique within its rule set)
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: Option<String>,

    /// Higher priority rules are evaluated first
    #[serde(default)]
    pub priority: i32,

    /// Disabled rules are never candidates
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How the conditions combine; defaults to `all` (AND)
    #[serde(default)]
    pub combine: ConditionCombinator,

    /// Ordered conditions; an empty list always matches
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Transforms applied when the rule matches
    #[serde(default)]
    pub transforms: Vec<Transform>,
}

fn default_true() -> bool {
    true
}

impl Rule {
    /// Whether this rule should apply to the given record
    pub fn matches(&self, record: &DataRecord, ctx: &TransformationContext) -> Result<bool> {
        if self.conditions.is_empty() {
            return Ok(true);
        }
        match self.combine {
            ConditionCombinator::All => {
                for condition in &self.conditions {
                    if !condition.evaluate(record, ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ConditionCombinator::Any => {
                for condition in &self.conditions {
                    if condition.evaluate(record, ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

/// How a rule set selects and applies matching rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Evaluate by descending priority, apply every match (honors
    /// `stop_on_first_match`)
    #[default]
    Sequential,
    /// Evaluate matches concurrently; application order is best-effort
    Parallel,
    /// Apply only the highest-priority matching rule
    FirstMatch,
    /// Apply every matching rule, in priority order, to the evolving record
    AllMatches,
}

/// An ordered collection of rules plus an execution strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    /// Rule set name
    pub name: String,

    /// Member rules
    #[serde(default)]
    pub rules: Vec<Rule>,

    /// How matching rules are selected and applied
    #[serde(default)]
    pub strategy: ExecutionStrategy,

    /// Under `sequential`, stop after the first matching rule
    #[serde(default)]
    pub stop_on_first_match: bool,
}

impl RuleSet {
    /// Enabled rules in evaluation order: descending priority, stable for
    /// equal priorities.
    pub fn candidates(&self) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self.rules.iter().filter(|r| r.enabled).collect();
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
        rules
    }

    /// Whether every rule's conditions are record-local, making the set
    /// eligible for parallel batch processing.
    pub fn is_record_local(&self) -> bool {
        self.rules
            .iter()
            .all(|r| r.conditions.iter().all(Condition::is_record_local))
    }
}
