//! Field mapping
//!
//! Mappings compute one target field per entry from a record's existing
//! fields. Only flat (single-segment) field paths are supported: a dotted
//! target like `customer.name` is written as a literal flat key, not
//! expanded into a nested structure.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::TransformationContext;
use crate::error::{Error, Result};
use crate::expr;
use crate::record::DataRecord;
use crate::rules::Condition;

/// A user-supplied value function, registered by name
pub type ValueFunction = Arc<dyn Fn(&DataRecord) -> Result<Value> + Send + Sync>;

/// Named value functions available to `custom` mappings and transforms
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, ValueFunction>,
}

impl FunctionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under a name, replacing any previous one
    pub fn register(
        &mut self,
        name: impl Into<String>,
        function: impl Fn(&DataRecord) -> Result<Value> + Send + Sync + 'static,
    ) {
        self.functions.insert(name.into(), Arc::new(function));
    }

    /// Look up a function by name
    pub fn get(&self, name: &str) -> Option<&ValueFunction> {
        self.functions.get(name)
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A value-level transformation applied to a single source value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ValueTransform {
    /// Uppercase the string form of the value
    Uppercase,
    /// Lowercase the string form of the value
    Lowercase,
    /// Trim surrounding whitespace
    Trim,
    /// Coerce to a JSON number
    ToNumber,
    /// Coerce to a JSON string
    ToText,
    /// Render a Jinja template against the whole record
    Template {
        /// Template source
        template: String,
    },
    /// Extract a regex capture group from the string form of the value
    RegexExtract {
        /// Pattern with at least one capture group
        pattern: String,
        /// Capture group index (defaults to 1)
        #[serde(default = "default_group")]
        group: usize,
    },
}

fn default_group() -> usize {
    1
}

/// Aggregation applied across multiple source fields of one record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AggregateOp {
    /// Numeric sum of the source values
    Sum,
    /// Numeric minimum
    Min,
    /// Numeric maximum
    Max,
    /// Count of present, non-null source values
    Count,
    /// Join string forms with a separator
    Concat {
        /// Separator between values
        #[serde(default)]
        separator: String,
    },
}

/// How a mapping computes its target value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MappingKind {
    /// Copy the source field's value
    Direct,

    /// Apply a value transformation to the source field
    Transform {
        /// The value transformation
        transform: ValueTransform,
    },

    /// Write a constant value
    Constant {
        /// The constant
        value: Value,
    },

    /// Branch between the primary source and an alternative source field
    Conditional {
        /// Predicate deciding the branch
        when: Box<Condition>,
        /// Source field used when the predicate is false
        otherwise: String,
    },

    /// Substitute through an inline lookup table keyed by the source
    /// value's string form
    Lookup {
        /// Key to value substitutions
        table: HashMap<String, Value>,
        /// Value when the key is absent from the table
        #[serde(default)]
        fallback: Option<Value>,
    },

    /// Aggregate multiple source fields into one value
    Aggregate {
        /// The aggregation
        aggregate: AggregateOp,
        /// Source fields, in order
        sources: Vec<String>,
    },

    /// Call a named function from the registry
    Custom {
        /// Registered function name
        function: String,
    },
}

/// One field mapping: a source path, a target path, and a computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Target field name (flat key; dotted names are written literally)
    pub target: String,

    /// Source field name; unused by `constant`, `aggregate` and `custom`
    #[serde(default)]
    pub source: Option<String>,

    /// How the value is computed
    #[serde(flatten)]
    pub kind: MappingKind,

    /// Substituted when the computed value is null
    #[serde(default)]
    pub default: Option<Value>,
}

impl FieldMapping {
    /// Compute this mapping's value from the record.
    ///
    /// Returns the raw computed value; null-to-default substitution happens
    /// in [`apply_mappings`].
    pub fn compute(
        &self,
        record: &DataRecord,
        ctx: &TransformationContext,
        functions: &FunctionRegistry,
    ) -> Result<Value> {
        let source_value = |name: &Option<String>| -> Value {
            name.as_deref()
                .and_then(|f| record.get(f))
                .cloned()
                .unwrap_or(Value::Null)
        };

        match &self.kind {
            MappingKind::Direct => Ok(source_value(&self.source)),
            MappingKind::Transform { transform } => {
                apply_value_transform(transform, source_value(&self.source), record, ctx)
            }
            MappingKind::Constant { value } => Ok(value.clone()),
            MappingKind::Conditional { when, otherwise } => {
                let field = if when.evaluate(record, ctx)? {
                    self.source.clone()
                } else {
                    Some(otherwise.clone())
                };
                Ok(source_value(&field))
            }
            MappingKind::Lookup { table, fallback } => {
                let key = match source_value(&self.source) {
                    Value::Null => return Ok(fallback.clone().unwrap_or(Value::Null)),
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                Ok(table
                    .get(&key)
                    .cloned()
                    .or_else(|| fallback.clone())
                    .unwrap_or(Value::Null))
            }
            MappingKind::Aggregate { aggregate, sources } => {
                aggregate_fields(aggregate, sources, record)
            }
            MappingKind::Custom { function } => {
                let f = functions.get(function).ok_or_else(|| Error::Transformation {
                    transformation: "field_map".to_string(),
                    record_index: Some(record.row_number),
                    field: Some(self.target.clone()),
                    message: format!("unknown custom function '{function}'"),
                })?;
                f(record)
            }
        }
    }
}

/// Apply a list of mappings to a record in place.
///
/// Returns the number of fields written; also bumps
/// `ctx.stats.fields_transformed`.
pub fn apply_mappings(
    mappings: &[FieldMapping],
    record: &mut DataRecord,
    ctx: &mut TransformationContext,
    functions: &FunctionRegistry,
) -> Result<u64> {
    let mut written = 0u64;
    // Mappings read the record as it was before this mapping list ran, so
    // one list cannot observe its own writes out of order.
    let snapshot = record.clone();
    for mapping in mappings {
        let computed = mapping.compute(&snapshot, ctx, functions)?;
        let value = match (computed, &mapping.default) {
            (Value::Null, Some(default)) => default.clone(),
            (value, _) => value,
        };
        record.set(mapping.target.clone(), value);
        written += 1;
    }
    ctx.stats.fields_transformed += written;
    Ok(written)
}

fn apply_value_transform(
    transform: &ValueTransform,
    value: Value,
    record: &DataRecord,
    ctx: &TransformationContext,
) -> Result<Value> {
    let result = match transform {
        ValueTransform::Uppercase => match value {
            Value::String(s) => Value::String(s.to_uppercase()),
            Value::Null => Value::Null,
            other => Value::String(text_of(&other).to_uppercase()),
        },
        ValueTransform::Lowercase => match value {
            Value::String(s) => Value::String(s.to_lowercase()),
            Value::Null => Value::Null,
            other => Value::String(text_of(&other).to_lowercase()),
        },
        ValueTransform::Trim => match value {
            Value::String(s) => Value::String(s.trim().to_string()),
            other => other,
        },
        ValueTransform::ToNumber => match &value {
            Value::Number(_) => value,
            Value::String(s) => match s.trim().parse::<f64>() {
                Ok(n) => serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                Err(_) => {
                    return Err(Error::transformation(
                        "to_number",
                        format!("'{s}' is not a number"),
                    ))
                }
            },
            Value::Bool(b) => Value::from(if *b { 1 } else { 0 }),
            Value::Null => Value::Null,
            other => {
                return Err(Error::transformation(
                    "to_number",
                    format!("cannot convert {other} to a number"),
                ))
            }
        },
        ValueTransform::ToText => match value {
            Value::String(_) => value,
            Value::Null => Value::Null,
            other => Value::String(text_of(&other)),
        },
        ValueTransform::Template { template } => {
            Value::String(expr::render(template, record, &ctx.variables)?)
        }
        ValueTransform::RegexExtract { pattern, group } => {
            let re = Regex::new(pattern)?;
            let text = text_of(&value);
            match re.captures(&text).and_then(|c| c.get(*group)) {
                Some(m) => Value::String(m.as_str().to_string()),
                None => Value::Null,
            }
        }
    };
    Ok(result)
}

fn aggregate_fields(op: &AggregateOp, sources: &[String], record: &DataRecord) -> Result<Value> {
    let values: Vec<&Value> = sources.iter().filter_map(|f| record.get(f)).collect();
    let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();

    let result = match op {
        AggregateOp::Sum => number(numbers.iter().sum()),
        AggregateOp::Min => numbers
            .iter()
            .copied()
            .fold(None::<f64>, |acc, n| Some(acc.map_or(n, |a| a.min(n))))
            .map(number)
            .unwrap_or(Value::Null),
        AggregateOp::Max => numbers
            .iter()
            .copied()
            .fold(None::<f64>, |acc, n| Some(acc.map_or(n, |a| a.max(n))))
            .map(number)
            .unwrap_or(Value::Null),
        AggregateOp::Count => Value::from(values.iter().filter(|v| !v.is_null()).count() as u64),
        AggregateOp::Concat { separator } => Value::String(
            values
                .iter()
                .filter(|v| !v.is_null())
                .map(|v| text_of(v))
                .collect::<Vec<_>>()
                .join(separator),
        ),
    };
    Ok(result)
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
