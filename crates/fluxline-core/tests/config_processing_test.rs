//! Integration tests for configuration driven record processing
//!
//! Tests use temporary directories with real JSONL fixtures to verify:
//! - Pipeline config parsing and validation
//! - File connectors feeding the transformation processor
//! - Transform pipes and rule sets driven entirely from YAML
//! - Error tagging across the processing pipeline

use std::collections::HashMap;

use fluxline_core::connectors::{DestinationConnector, FileDestinationConnector, FileSourceConnector, SourceConnector};
use fluxline_core::{
    PipelineConfig, StageType, TransformationContext, TransformationProcessor,
};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Write a JSONL fixture and return its path as a string.
fn write_jsonl(dir: &TempDir, name: &str, rows: &[serde_json::Value]) -> String {
    let path = dir.path().join(name);
    let body: String = rows
        .iter()
        .map(|r| format!("{r}\n"))
        .collect();
    std::fs::write(&path, body).unwrap();
    path.to_str().unwrap().to_string()
}

#[test]
fn test_full_pipeline_config_parses_and_validates() {
    let yaml = r#"
name: order-sync
description: Nightly order sync
timeout_ms: 60000
error_handling:
  stop_on_error: false
  max_errors: 50
retry:
  max_attempts: 3
  delay_ms: 500
stages:
  - name: ingest
    type: extract
    order: 10
    connector: orders_db
    batch_size: 500
  - name: normalize
    type: transform
    order: 20
    transforms:
      - field_map:
          - target: customer_id
            source: cust_id
            kind: direct
      - drop:
          - cust_id
  - name: classify
    type: transform
    order: 30
    rules:
      name: tiers
      strategy: first_match
      rules:
        - id: premium
          priority: 10
          conditions:
            - type: field_value
              field: amount
              operator: greater_than_or_equal
              value: 1000
          transforms:
            - add_fields:
                tier: premium
  - name: deliver
    type: load
    order: 40
    connector: warehouse
    retry:
      max_attempts: 5
      delay_ms: 2000
"#;

    let config = PipelineConfig::from_yaml(yaml).unwrap();
    let report = config.validate();
    assert!(report.is_valid, "unexpected errors: {:?}", report.errors);

    let order: Vec<&str> = config
        .execution_order()
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(order, vec!["ingest", "normalize", "classify", "deliver"]);

    // Stage retry overrides the pipeline default.
    let deliver = config.stages.iter().find(|s| s.name == "deliver").unwrap();
    assert_eq!(config.retry_for(deliver).max_attempts, 5);
    let ingest = config.stages.iter().find(|s| s.name == "ingest").unwrap();
    assert_eq!(config.retry_for(ingest).max_attempts, 3);
    assert_eq!(ingest.stage_type, StageType::Extract);
}

#[tokio::test]
async fn test_file_to_file_processing_round() {
    let dir = TempDir::new().unwrap();
    let input = write_jsonl(
        &dir,
        "orders.jsonl",
        &[
            json!({"cust_id": "c-1", "amount": 1500}),
            json!({"cust_id": "c-2", "amount": 40}),
            json!({"cust_id": "c-3", "amount": 800}),
        ],
    );
    let output = dir.path().join("out.jsonl");

    let stage_yaml = r#"
- field_map:
    - target: customer_id
      source: cust_id
      kind: direct
- drop:
    - cust_id
- filter:
    type: field_value
    field: amount
    operator: greater_than
    value: 100
"#;
    let transforms: Vec<fluxline_core::Transform> = serde_yaml::from_str(stage_yaml).unwrap();

    let processor = TransformationProcessor::new().with_max_parallelism(1);
    let mut ctx = TransformationContext::new();
    let cancel = CancellationToken::new();

    let mut source = FileSourceConnector::new(&input);
    let mut sink = FileDestinationConnector::new(output.to_str().unwrap());

    while let Some(batch) = source.read_batch(100, &cancel).await.unwrap() {
        let results = processor
            .process_records(batch, &transforms, &mut ctx, &cancel)
            .await;
        let kept: Vec<_> = results.into_iter().filter_map(|r| r.record).collect();
        sink.write_batch(&kept, &cancel).await.unwrap();
    }

    assert_eq!(ctx.stats.records_processed, 3);
    assert_eq!(ctx.stats.records_transformed, 2);
    assert_eq!(ctx.stats.records_skipped, 1);

    let written = std::fs::read_to_string(&output).unwrap();
    let rows: Vec<serde_json::Value> = written
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["customer_id"], "c-1");
    assert!(rows[0].get("cust_id").is_none());
}

#[tokio::test]
async fn test_expression_conditions_see_parameters() {
    let transforms: Vec<fluxline_core::Transform> = serde_yaml::from_str(
        r#"
- filter:
    type: expression
    expression: "amount > vars.threshold"
"#,
    )
    .unwrap();

    let processor = TransformationProcessor::new().with_max_parallelism(1);
    let mut ctx = TransformationContext::with_variables(
        [("threshold".to_string(), json!(100))].into_iter().collect(),
    );
    let cancel = CancellationToken::new();

    let records = vec![
        fluxline_core::DataRecord::from_value(json!({"amount": 150})),
        fluxline_core::DataRecord::from_value(json!({"amount": 50})),
    ];
    let results = processor
        .process_records(records, &transforms, &mut ctx, &cancel)
        .await;
    let kept = results.iter().filter(|r| r.record.is_some()).count();
    assert_eq!(kept, 1);
}

#[tokio::test]
async fn test_malformed_input_line_is_tagged_with_position() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.jsonl");
    std::fs::write(&path, "{\"ok\":1}\nnot-json\n").unwrap();

    let mut source = FileSourceConnector::new(path.to_str().unwrap());
    let cancel = CancellationToken::new();
    let err = source.read_batch(10, &cancel).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("line 2"), "got: {message}");
}

#[test]
fn test_parameters_type_is_plain_json_map() {
    // Execution parameters are ordinary JSON values keyed by name.
    let params: HashMap<String, serde_json::Value> =
        [("env".to_string(), json!("prod"))].into_iter().collect();
    let ctx = TransformationContext::with_variables(params);
    assert_eq!(ctx.variables.get("env"), Some(&json!("prod")));
}
