//! Record-level transforms
//!
//! Transforms modify records as they flow through a Transform stage. A list
//! of transforms is a pipe: each transform's output records become the input
//! set for the next one, so a transform may fan out (emit several records)
//! or terminate a lineage (emit none).
//!
//! # Built-in Transforms
//!
//! - `field_map` - Compute target fields via field mappings
//! - `filter` - Keep only records matching a condition
//! - `drop` - Remove fields from records
//! - `add_fields` - Add constant fields
//! - `rename` - Rename fields
//! - `split` - Fan out one record per element of an array field
//!
//! # Example
//!
//! ```yaml
//! transforms:
//!   - field_map:
//!       - target: customer_id
//!         source: cust_id
//!         kind: direct
//!
//!   - filter:
//!       type: field_value
//!       field: amount
//!       operator: greater_than
//!       value: 100
//!
//!   - drop:
//!       - internal_id
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::TransformationContext;
use crate::error::{Error, Result};
use crate::mapping::{apply_mappings, FieldMapping, FunctionRegistry};
use crate::record::DataRecord;
use crate::rules::Condition;

/// Configuration for the `split` fan-out transform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Array field to fan out on
    pub field: String,
}

/// One record-level transform
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Transform {
    /// Compute target fields via field mappings
    FieldMap {
        /// The mappings, applied in order
        field_map: Vec<FieldMapping>,
    },

    /// Keep only records matching the condition; non-matches terminate
    /// their lineage (not an error)
    Filter {
        /// The predicate
        filter: Condition,
    },

    /// Remove the named fields
    Drop {
        /// Fields to drop
        drop: Vec<String>,
    },

    /// Add constant fields
    AddFields {
        /// Fields to add
        add_fields: HashMap<String, Value>,
    },

    /// Rename fields: new name <- old name
    Rename {
        /// target name to source name
        rename: HashMap<String, String>,
    },

    /// Fan out: one output record per element of an array field. Object
    /// elements are merged into the parent's fields; scalar elements
    /// replace the split field's value.
    Split {
        /// Split configuration
        split: SplitConfig,
    },
}

impl Transform {
    /// Stable id used in error tags and logs
    pub fn id(&self) -> &'static str {
        match self {
            Self::FieldMap { .. } => "field_map",
            Self::Filter { .. } => "filter",
            Self::Drop { .. } => "drop",
            Self::AddFields { .. } => "add_fields",
            Self::Rename { .. } => "rename",
            Self::Split { .. } => "split",
        }
    }

    /// Whether this transform may run against per-record child contexts.
    ///
    /// A batch is processed in parallel only if every transform in the list
    /// is parallel safe.
    pub fn is_parallel_safe(&self) -> bool {
        match self {
            Self::Filter { filter } => filter.is_record_local(),
            Self::FieldMap { field_map } => field_map.iter().all(|m| match &m.kind {
                crate::mapping::MappingKind::Conditional { when, .. } => when.is_record_local(),
                _ => true,
            }),
            _ => true,
        }
    }

    /// Apply this transform to one record, producing zero or more outputs.
    pub fn apply(
        &self,
        record: &DataRecord,
        ctx: &mut TransformationContext,
        functions: &FunctionRegistry,
    ) -> Result<Vec<DataRecord>> {
        match self {
            Self::FieldMap { field_map } => {
                let mut out = record.clone();
                apply_mappings(field_map, &mut out, ctx, functions)?;
                Ok(vec![out])
            }
            Self::Filter { filter } => {
                if filter.evaluate(record, ctx)? {
                    Ok(vec![record.clone()])
                } else {
                    Ok(vec![])
                }
            }
            Self::Drop { drop } => {
                let mut out = record.clone();
                for field in drop {
                    out.remove(field);
                }
                Ok(vec![out])
            }
            Self::AddFields { add_fields } => {
                let mut out = record.clone();
                for (field, value) in add_fields {
                    out.set(field.clone(), value.clone());
                }
                Ok(vec![out])
            }
            Self::Rename { rename } => {
                let mut out = record.clone();
                for (target, source) in rename {
                    if let Some(value) = out.remove(source) {
                        out.set(target.clone(), value);
                    }
                }
                Ok(vec![out])
            }
            Self::Split { split } => {
                let Some(value) = record.get(&split.field) else {
                    return Ok(vec![record.clone()]);
                };
                let Value::Array(elements) = value.clone() else {
                    return Err(Error::Transformation {
                        transformation: "split".to_string(),
                        record_index: Some(record.row_number),
                        field: Some(split.field.clone()),
                        message: "split field is not an array".to_string(),
                    });
                };
                let mut outputs = Vec::with_capacity(elements.len());
                for element in elements {
                    let mut out = record.clone();
                    match element {
                        Value::Object(entries) => {
                            out.remove(&split.field);
                            for (field, value) in entries {
                                out.set(field, value);
                            }
                        }
                        scalar => out.set(split.field.clone(), scalar),
                    }
                    outputs.push(out);
                }
                Ok(outputs)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ComparisonOperator;
    use serde_json::json;

    fn apply(transform: &Transform, fields: Value) -> Vec<DataRecord> {
        let record = DataRecord::from_value(fields);
        let mut ctx = TransformationContext::new();
        transform
            .apply(&record, &mut ctx, &FunctionRegistry::new())
            .unwrap()
    }

    #[test]
    fn test_filter_keeps_matching() {
        let transform = Transform::Filter {
            filter: Condition::FieldValue {
                field: "amount".to_string(),
                operator: ComparisonOperator::GreaterThan,
                value: Some(json!(100)),
            },
        };
        assert_eq!(apply(&transform, json!({"amount": 150})).len(), 1);
        assert_eq!(apply(&transform, json!({"amount": 50})).len(), 0);
    }

    #[test]
    fn test_drop_removes_fields() {
        let transform = Transform::Drop {
            drop: vec!["b".to_string()],
        };
        let out = apply(&transform, json!({"a": 1, "b": 2, "c": 3}));
        assert_eq!(out.len(), 1);
        assert!(out[0].get("b").is_none());
        assert_eq!(out[0].get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_add_fields_inserts_values() {
        let transform = Transform::AddFields {
            add_fields: [("processed".to_string(), json!(true))].into_iter().collect(),
        };
        let out = apply(&transform, json!({"a": 1}));
        assert_eq!(out[0].get("processed"), Some(&json!(true)));
    }

    #[test]
    fn test_rename_moves_value() {
        let transform = Transform::Rename {
            rename: [("full_name".to_string(), "name".to_string())]
                .into_iter()
                .collect(),
        };
        let out = apply(&transform, json!({"name": "Ada"}));
        assert_eq!(out[0].get("full_name"), Some(&json!("Ada")));
        assert!(out[0].get("name").is_none());
    }

    #[test]
    fn test_split_fans_out_objects() {
        let transform = Transform::Split {
            split: SplitConfig {
                field: "items".to_string(),
            },
        };
        let out = apply(
            &transform,
            json!({"order": 1, "items": [{"sku": "a"}, {"sku": "b"}]}),
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("order"), Some(&json!(1)));
        assert_eq!(out[0].get("sku"), Some(&json!("a")));
        assert!(out[0].get("items").is_none());
        assert_eq!(out[1].get("sku"), Some(&json!("b")));
    }

    #[test]
    fn test_split_scalars_replace_field() {
        let transform = Transform::Split {
            split: SplitConfig {
                field: "tag".to_string(),
            },
        };
        let out = apply(&transform, json!({"tag": ["x", "y"]}));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("tag"), Some(&json!("x")));
        assert_eq!(out[1].get("tag"), Some(&json!("y")));
    }

    #[test]
    fn test_split_non_array_errors() {
        let transform = Transform::Split {
            split: SplitConfig {
                field: "tag".to_string(),
            },
        };
        let record = DataRecord::from_value(json!({"tag": "scalar"}));
        let mut ctx = TransformationContext::new();
        let result = transform.apply(&record, &mut ctx, &FunctionRegistry::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_parallel_safety() {
        let safe = Transform::Filter {
            filter: Condition::Always,
        };
        assert!(safe.is_parallel_safe());

        let unsafe_filter = Transform::Filter {
            filter: Condition::RecordCount {
                operator: ComparisonOperator::LessThan,
                value: 10,
            },
        };
        assert!(!unsafe_filter.is_parallel_safe());
    }

    #[test]
    fn test_parse_field_map_transform() {
        let yaml = r#"
field_map:
  - target: customer_id
    source: cust_id
    kind: direct
"#;
        let transform: Transform = serde_yaml::from_str(yaml).unwrap();
        match transform {
            Transform::FieldMap { field_map } => {
                assert_eq!(field_map.len(), 1);
                assert_eq!(field_map[0].target, "customer_id");
            }
            _ => panic!("Expected field_map transform"),
        }
    }

    #[test]
    fn test_parse_filter_transform() {
        let yaml = r#"
filter:
  type: field_value
  field: amount
  operator: greater_than
  value: 100
"#;
        let transform: Transform = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(transform.id(), "filter");
    }

    #[test]
    fn test_parse_drop_transform() {
        let yaml = r#"
drop:
  - internal_id
  - debug_info
"#;
        let transform: Transform = serde_yaml::from_str(yaml).unwrap();
        match transform {
            Transform::Drop { drop } => assert_eq!(drop.len(), 2),
            _ => panic!("Expected drop transform"),
        }
    }
}
