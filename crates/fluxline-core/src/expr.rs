//! Expression and template evaluation
//!
//! Free-form conditions and template value transforms are Jinja expressions
//! evaluated against the record's fields, with execution variables exposed
//! under `vars`.

use std::collections::HashMap;

use minijinja::Environment;
use serde_json::Value;

use crate::error::Result;
use crate::record::DataRecord;

/// Evaluate a Jinja expression against a record.
///
/// Record fields are in scope by name; execution variables under `vars`,
/// e.g. `amount > 1000 and vars.env == "prod"`.
pub fn evaluate(
    expression: &str,
    record: &DataRecord,
    variables: &HashMap<String, Value>,
) -> Result<minijinja::Value> {
    let env = Environment::new();
    let compiled = env.compile_expression(expression)?;
    let value = compiled.eval(scope(record, variables))?;
    Ok(value)
}

/// Evaluate a Jinja expression and coerce the result to a boolean
pub fn evaluate_bool(
    expression: &str,
    record: &DataRecord,
    variables: &HashMap<String, Value>,
) -> Result<bool> {
    Ok(evaluate(expression, record, variables)?.is_true())
}

/// Render a Jinja template string against a record
pub fn render(
    template: &str,
    record: &DataRecord,
    variables: &HashMap<String, Value>,
) -> Result<String> {
    let env = Environment::new();
    let rendered = env.render_str(template, scope(record, variables))?;
    Ok(rendered)
}

fn scope(record: &DataRecord, variables: &HashMap<String, Value>) -> minijinja::Value {
    let mut root: HashMap<String, Value> = record
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    root.insert(
        "vars".to_string(),
        Value::Object(variables.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
    );
    minijinja::Value::from_serialize(&root)
}
