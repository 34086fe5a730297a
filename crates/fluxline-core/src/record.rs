//! Data records flowing through a pipeline
//!
//! A record is an ordered field map plus provenance: the row number assigned
//! by its source and an optional source tag. Records are mutated in place by
//! transformations and never shared across concurrent processing of the same
//! logical record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A bounded group of records moved together between stages
pub type Batch = Vec<DataRecord>;

/// One row of structured data flowing through the pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    /// Ordered mapping of field name to value
    #[serde(default)]
    pub fields: Map<String, Value>,

    /// Monotonically increasing row number assigned by the source
    #[serde(default)]
    pub row_number: u64,

    /// Source tag (connector name, file path, topic)
    #[serde(default)]
    pub source: Option<String>,
}

impl DataRecord {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record from an ordered field map
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            row_number: 0,
            source: None,
        }
    }

    /// Create a record from a JSON value; non-object values are wrapped
    /// under a single `value` field.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self::from_fields(fields),
            other => {
                let mut fields = Map::new();
                fields.insert("value".to_string(), other);
                Self::from_fields(fields)
            }
        }
    }

    /// Set the row number (builder style)
    pub fn with_row_number(mut self, row_number: u64) -> Self {
        self.row_number = row_number;
        self
    }

    /// Set the source tag (builder style)
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Get a field value by name
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Set a field value, replacing any existing value
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    /// Remove a field, returning its previous value
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Whether the record has a field with this name
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Field names in insertion order
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The record's fields as a JSON object value
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}
