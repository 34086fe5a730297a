//! Transformation processor
//!
//! Applies transform lists or rule sets to records and batches. A transform
//! list is a pipe: each transform's output records feed the next transform.
//! Batches run sequentially (order preserving) or, when every transform is
//! parallel safe, as a bounded record-level fan-out over child contexts with
//! no ordering guarantee across records.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::context::TransformationContext;
use crate::error::{Error, Result};
use crate::mapping::FunctionRegistry;
use crate::record::DataRecord;
use crate::rules::{ExecutionStrategy, Rule, RuleSet};
use crate::transforms::Transform;

/// Outcome of processing one record lineage.
///
/// Fan-out is modeled as one result per output record. A lineage that was
/// filtered out carries `record: None` and counts as a success.
#[derive(Debug)]
pub struct TransformationResult {
    /// Whether the lineage completed without error
    pub success: bool,
    /// The output record, if the lineage produced one
    pub record: Option<DataRecord>,
    /// Errors raised while processing the lineage
    pub errors: Vec<Error>,
}

impl TransformationResult {
    /// A successful result carrying an output record
    pub fn success(record: DataRecord) -> Self {
        Self {
            success: true,
            record: Some(record),
            errors: Vec::new(),
        }
    }

    /// A successful result for a lineage that terminated without output
    pub fn filtered() -> Self {
        Self {
            success: true,
            record: None,
            errors: Vec::new(),
        }
    }

    /// A failed result carrying the error
    pub fn failure(error: Error) -> Self {
        Self {
            success: false,
            record: None,
            errors: vec![error],
        }
    }
}

/// Applies transformations and rule sets to records and batches
#[derive(Debug, Clone)]
pub struct TransformationProcessor {
    functions: FunctionRegistry,
    max_parallelism: usize,
}

impl Default for TransformationProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformationProcessor {
    /// Create a processor with one worker per available processor
    pub fn new() -> Self {
        Self {
            functions: FunctionRegistry::new(),
            max_parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }

    /// Bound record-level parallelism; 1 disables parallel processing
    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism.max(1);
        self
    }

    /// Register a custom value function for `custom` mappings
    pub fn register_function(
        &mut self,
        name: impl Into<String>,
        function: impl Fn(&DataRecord) -> Result<serde_json::Value> + Send + Sync + 'static,
    ) {
        self.functions.register(name, function);
    }

    /// The processor's function registry
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Process one record through a transform pipe
    pub async fn process_record(
        &self,
        record: DataRecord,
        transforms: &[Transform],
        ctx: &mut TransformationContext,
        cancel: &CancellationToken,
    ) -> Vec<TransformationResult> {
        run_record(&self.functions, record, transforms, ctx, cancel)
    }

    /// Process a batch through a transform pipe.
    ///
    /// Runs in parallel only when every transform is parallel safe and the
    /// parallelism bound allows it; parallel results are unordered.
    pub async fn process_records(
        &self,
        records: Vec<DataRecord>,
        transforms: &[Transform],
        ctx: &mut TransformationContext,
        cancel: &CancellationToken,
    ) -> Vec<TransformationResult> {
        let parallel = records.len() > 1
            && self.max_parallelism > 1
            && transforms.iter().all(Transform::is_parallel_safe);

        if !parallel {
            let mut results = Vec::new();
            for record in records {
                if cancel.is_cancelled() {
                    break;
                }
                results.extend(run_record(&self.functions, record, transforms, ctx, cancel));
            }
            return results;
        }

        self.process_parallel(records, transforms, ctx, cancel).await
    }

    async fn process_parallel(
        &self,
        records: Vec<DataRecord>,
        transforms: &[Transform],
        ctx: &mut TransformationContext,
        cancel: &CancellationToken,
    ) -> Vec<TransformationResult> {
        let transforms: Arc<Vec<Transform>> = Arc::new(transforms.to_vec());
        let proto = ctx.child();

        let units = records.into_iter().map(|record| {
            let functions = self.functions.clone();
            let transforms = Arc::clone(&transforms);
            let mut child = proto.child();
            let cancel = cancel.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    let results = if cancel.is_cancelled() {
                        Vec::new()
                    } else {
                        run_record(&functions, record, &transforms, &mut child, &cancel)
                    };
                    (child, results)
                })
                .await
            }
        });

        let mut stream = futures::stream::iter(units).buffer_unordered(self.max_parallelism);
        let mut all = Vec::new();
        while let Some(joined) = stream.next().await {
            match joined {
                Ok((child, results)) => {
                    // Single merge point; children never touch the parent.
                    ctx.absorb(child);
                    all.extend(results);
                }
                Err(e) => {
                    tracing::error!(error = %e, "parallel transformation worker failed");
                    ctx.add_error(None, None, None, format!("worker failed: {e}"));
                }
            }
        }
        all
    }

    /// Process a batch through a rule set using its execution strategy
    pub async fn process_with_rules(
        &self,
        records: Vec<DataRecord>,
        rule_set: &RuleSet,
        ctx: &mut TransformationContext,
        cancel: &CancellationToken,
    ) -> Vec<TransformationResult> {
        let candidates = rule_set.candidates();
        let mut results = Vec::new();
        for record in records {
            if cancel.is_cancelled() {
                break;
            }
            match rule_set.strategy {
                ExecutionStrategy::Parallel => {
                    results.extend(
                        self.apply_rules_parallel(record, &candidates, ctx, cancel).await,
                    );
                }
                _ => {
                    results.extend(self.apply_rules_sequential(
                        record,
                        rule_set,
                        &candidates,
                        ctx,
                        cancel,
                    ));
                }
            }
        }
        results
    }

    fn apply_rules_sequential(
        &self,
        record: DataRecord,
        rule_set: &RuleSet,
        candidates: &[&Rule],
        ctx: &mut TransformationContext,
        cancel: &CancellationToken,
    ) -> Vec<TransformationResult> {
        let start = Instant::now();
        ctx.stats.records_processed += 1;
        ctx.next_record_index();
        let row = record.row_number;

        let mut current = vec![record];
        let mut failure: Option<(&'static str, Error)> = None;

        'rules: for rule in candidates {
            if cancel.is_cancelled() || current.is_empty() {
                break;
            }
            let mut next = Vec::with_capacity(current.len());
            let mut rule_matched = false;
            for rec in std::mem::take(&mut current) {
                let is_match = match rule.matches(&rec, ctx) {
                    Ok(m) => m,
                    Err(e) => {
                        failure = Some(("rule_match", e));
                        break 'rules;
                    }
                };
                if !is_match {
                    next.push(rec);
                    continue;
                }
                rule_matched = true;
                match apply_pipe(&self.functions, rec, &rule.transforms, ctx, cancel) {
                    Ok(outputs) => next.extend(outputs),
                    Err((id, e)) => {
                        failure = Some((id, e));
                        break 'rules;
                    }
                }
            }
            current = next;

            if rule_matched {
                let stop = match rule_set.strategy {
                    ExecutionStrategy::FirstMatch => true,
                    ExecutionStrategy::Sequential => rule_set.stop_on_first_match,
                    _ => false,
                };
                if stop {
                    break;
                }
            }
        }

        let results = finalize_record(row, current, failure, ctx);
        ctx.stats.processing_time_ms += start.elapsed().as_millis() as u64;
        results
    }

    /// Parallel strategy: matches are evaluated concurrently against the
    /// incoming record, then matched rules are applied in priority order.
    /// Side-effect ordering across matched rules is best-effort.
    async fn apply_rules_parallel(
        &self,
        record: DataRecord,
        candidates: &[&Rule],
        ctx: &mut TransformationContext,
        cancel: &CancellationToken,
    ) -> Vec<TransformationResult> {
        let start = Instant::now();
        ctx.stats.records_processed += 1;
        ctx.next_record_index();
        let row = record.row_number;

        let matches: Vec<Result<bool>> = {
            let snapshot: &TransformationContext = ctx;
            let record = &record;
            futures::future::join_all(
                candidates
                    .iter()
                    .map(|rule| async move { rule.matches(record, snapshot) }),
            )
            .await
        };

        let mut current = vec![record];
        let mut failure: Option<(&'static str, Error)> = None;
        for (rule, matched) in candidates.iter().zip(matches) {
            if cancel.is_cancelled() || current.is_empty() {
                break;
            }
            match matched {
                Ok(false) => continue,
                Ok(true) => {
                    let mut next = Vec::with_capacity(current.len());
                    for rec in current {
                        match apply_pipe(&self.functions, rec, &rule.transforms, ctx, cancel) {
                            Ok(outputs) => next.extend(outputs),
                            Err((id, e)) => {
                                failure = Some((id, e));
                                next.clear();
                                break;
                            }
                        }
                    }
                    current = next;
                    if failure.is_some() {
                        break;
                    }
                }
                Err(e) => {
                    failure = Some(("rule_match", e));
                    current = Vec::new();
                    break;
                }
            }
        }

        let results = finalize_record(row, current, failure, ctx);
        ctx.stats.processing_time_ms += start.elapsed().as_millis() as u64;
        results
    }
}

/// Run one record through a transform pipe and account for the outcome
fn run_record(
    functions: &FunctionRegistry,
    record: DataRecord,
    transforms: &[Transform],
    ctx: &mut TransformationContext,
    cancel: &CancellationToken,
) -> Vec<TransformationResult> {
    let start = Instant::now();
    ctx.stats.records_processed += 1;
    ctx.next_record_index();
    let row = record.row_number;

    let outcome = apply_pipe(functions, record, transforms, ctx, cancel);
    let results = match outcome {
        Ok(outputs) => finalize_record(row, outputs, None, ctx),
        Err(failure) => finalize_record(row, Vec::new(), Some(failure), ctx),
    };
    ctx.stats.processing_time_ms += start.elapsed().as_millis() as u64;
    results
}

/// Apply a transform pipe to one record; each transform's outputs become
/// the next transform's inputs. An empty output set ends the pipe early.
fn apply_pipe(
    functions: &FunctionRegistry,
    record: DataRecord,
    transforms: &[Transform],
    ctx: &mut TransformationContext,
    cancel: &CancellationToken,
) -> std::result::Result<Vec<DataRecord>, (&'static str, Error)> {
    let mut current = vec![record];
    for transform in transforms {
        if cancel.is_cancelled() || current.is_empty() {
            break;
        }
        let mut next = Vec::with_capacity(current.len());
        for rec in &current {
            let outputs = transform
                .apply(rec, ctx, functions)
                .map_err(|e| (transform.id(), e))?;
            next.extend(outputs);
        }
        current = next;
    }
    Ok(current)
}

/// Book the outcome of one record lineage into the context and build its
/// results.
fn finalize_record(
    row: u64,
    outputs: Vec<DataRecord>,
    failure: Option<(&'static str, Error)>,
    ctx: &mut TransformationContext,
) -> Vec<TransformationResult> {
    if let Some((transform_id, error)) = failure {
        ctx.stats.records_failed += 1;
        let field = match &error {
            Error::Transformation { field, .. } => field.clone(),
            _ => None,
        };
        tracing::debug!(transform = transform_id, row, error = %error, "record failed");
        ctx.add_error(
            Some(row),
            field,
            Some(transform_id.to_string()),
            error.to_string(),
        );
        return vec![TransformationResult::failure(error)];
    }

    if outputs.is_empty() {
        ctx.stats.records_skipped += 1;
        return vec![TransformationResult::filtered()];
    }

    ctx.stats.records_transformed += 1;
    outputs
        .into_iter()
        .map(TransformationResult::success)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{FieldMapping, MappingKind};
    use crate::rules::{ComparisonOperator, Condition, ConditionCombinator};
    use serde_json::json;

    fn records(n: u64) -> Vec<DataRecord> {
        (1..=n)
            .map(|i| DataRecord::from_value(json!({"id": i})).with_row_number(i))
            .collect()
    }

    fn add_field(name: &str, value: serde_json::Value) -> Transform {
        Transform::AddFields {
            add_fields: [(name.to_string(), value)].into_iter().collect(),
        }
    }

    fn rule(id: &str, priority: i32, conditions: Vec<Condition>, transforms: Vec<Transform>) -> Rule {
        Rule {
            id: id.to_string(),
            name: None,
            priority,
            enabled: true,
            combine: ConditionCombinator::All,
            conditions,
            transforms,
        }
    }

    #[tokio::test]
    async fn test_pipe_composition_order() {
        let processor = TransformationProcessor::new();
        let mut ctx = TransformationContext::new();
        let cancel = CancellationToken::new();
        let transforms = vec![
            add_field("a", json!(1)),
            Transform::Rename {
                rename: [("b".to_string(), "a".to_string())].into_iter().collect(),
            },
        ];
        let results = processor
            .process_record(
                DataRecord::from_value(json!({})),
                &transforms,
                &mut ctx,
                &cancel,
            )
            .await;
        assert_eq!(results.len(), 1);
        let record = results[0].record.as_ref().unwrap();
        assert_eq!(record.get("b"), Some(&json!(1)));
        assert!(record.get("a").is_none());
    }

    #[tokio::test]
    async fn test_filter_terminates_lineage_silently() {
        let processor = TransformationProcessor::new();
        let mut ctx = TransformationContext::new();
        let cancel = CancellationToken::new();
        let transforms = vec![
            Transform::Filter {
                filter: Condition::Never,
            },
            add_field("never_reached", json!(true)),
        ];
        let results = processor
            .process_record(
                DataRecord::from_value(json!({"id": 1})),
                &transforms,
                &mut ctx,
                &cancel,
            )
            .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert!(results[0].record.is_none());
        assert_eq!(ctx.stats.records_skipped, 1);
        assert_eq!(ctx.error_count(), 0);
    }

    #[tokio::test]
    async fn test_fan_out_one_result_per_output() {
        let processor = TransformationProcessor::new();
        let mut ctx = TransformationContext::new();
        let cancel = CancellationToken::new();
        let transforms = vec![Transform::Split {
            split: crate::transforms::SplitConfig {
                field: "items".to_string(),
            },
        }];
        let results = processor
            .process_record(
                DataRecord::from_value(json!({"items": [1, 2, 3]})),
                &transforms,
                &mut ctx,
                &cancel,
            )
            .await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(ctx.stats.records_transformed, 1);
    }

    #[tokio::test]
    async fn test_error_does_not_abort_batch() {
        let processor = TransformationProcessor::new().with_max_parallelism(1);
        let mut ctx = TransformationContext::new();
        let cancel = CancellationToken::new();
        // Splitting a non-array errors for records where `items` is scalar.
        let transforms = vec![Transform::Split {
            split: crate::transforms::SplitConfig {
                field: "items".to_string(),
            },
        }];
        let batch = vec![
            DataRecord::from_value(json!({"items": [1]})).with_row_number(1),
            DataRecord::from_value(json!({"items": "bad"})).with_row_number(2),
            DataRecord::from_value(json!({"items": [2]})).with_row_number(3),
        ];
        let results = processor
            .process_records(batch, &transforms, &mut ctx, &cancel)
            .await;
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.success).count(), 2);
        assert_eq!(ctx.stats.records_failed, 1);
        assert_eq!(ctx.error_count(), 1);
        assert_eq!(ctx.errors[0].record_index, Some(2));
        assert_eq!(ctx.errors[0].transformation.as_deref(), Some("split"));
    }

    #[tokio::test]
    async fn test_sequential_preserves_order() {
        let processor = TransformationProcessor::new().with_max_parallelism(1);
        let mut ctx = TransformationContext::new();
        let cancel = CancellationToken::new();
        let results = processor
            .process_records(records(10), &[add_field("t", json!(1))], &mut ctx, &cancel)
            .await;
        let ids: Vec<u64> = results
            .iter()
            .map(|r| r.record.as_ref().unwrap().row_number)
            .collect();
        assert_eq!(ids, (1..=10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_parallel_batch_counts_are_exact() {
        let processor = TransformationProcessor::new().with_max_parallelism(4);
        let mut ctx = TransformationContext::new();
        let cancel = CancellationToken::new();
        let transforms = vec![add_field("processed", json!(true))];
        assert!(transforms.iter().all(Transform::is_parallel_safe));

        let results = processor
            .process_records(records(100), &transforms, &mut ctx, &cancel)
            .await;
        assert_eq!(results.len(), 100);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(ctx.stats.records_processed, 100);
        assert_eq!(ctx.stats.records_transformed, 100);
        assert_eq!(ctx.stats.records_failed, 0);
    }

    #[tokio::test]
    async fn test_record_count_condition_forces_sequential() {
        let transforms = vec![Transform::Filter {
            filter: Condition::RecordCount {
                operator: ComparisonOperator::LessThan,
                value: 5,
            },
        }];
        assert!(!transforms.iter().all(Transform::is_parallel_safe));

        // Still processes correctly, just sequentially.
        let processor = TransformationProcessor::new();
        let mut ctx = TransformationContext::new();
        let cancel = CancellationToken::new();
        let results = processor
            .process_records(records(10), &transforms, &mut ctx, &cancel)
            .await;
        assert_eq!(results.len(), 10);
        assert_eq!(ctx.stats.records_processed, 10);
    }

    #[tokio::test]
    async fn test_cancellation_stops_batch() {
        let processor = TransformationProcessor::new().with_max_parallelism(1);
        let mut ctx = TransformationContext::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = processor
            .process_records(records(10), &[add_field("t", json!(1))], &mut ctx, &cancel)
            .await;
        assert!(results.is_empty());
        assert_eq!(ctx.stats.records_processed, 0);
    }

    fn amount_rule_set(strategy: ExecutionStrategy, stop_on_first_match: bool) -> RuleSet {
        RuleSet {
            name: "tiers".to_string(),
            rules: vec![
                rule(
                    "low",
                    1,
                    vec![Condition::FieldValue {
                        field: "amount".to_string(),
                        operator: ComparisonOperator::GreaterThan,
                        value: Some(json!(10_000)),
                    }],
                    vec![add_field("vip", json!(true))],
                ),
                rule(
                    "high",
                    10,
                    vec![Condition::FieldValue {
                        field: "amount".to_string(),
                        operator: ComparisonOperator::GreaterThan,
                        value: Some(json!(100)),
                    }],
                    vec![add_field("tier", json!("premium"))],
                ),
                rule(
                    "mid",
                    5,
                    vec![Condition::FieldValue {
                        field: "amount".to_string(),
                        operator: ComparisonOperator::GreaterThan,
                        value: Some(json!(50)),
                    }],
                    vec![add_field("reviewed", json!(true))],
                ),
            ],
            strategy,
            stop_on_first_match,
        }
    }

    #[tokio::test]
    async fn test_first_match_applies_only_highest_priority() {
        let processor = TransformationProcessor::new();
        let mut ctx = TransformationContext::new();
        let cancel = CancellationToken::new();
        // amount 200 matches priority 10 and priority 5, not priority 1.
        let batch = vec![DataRecord::from_value(json!({"amount": 200}))];
        let results = processor
            .process_with_rules(
                batch,
                &amount_rule_set(ExecutionStrategy::FirstMatch, false),
                &mut ctx,
                &cancel,
            )
            .await;
        let record = results[0].record.as_ref().unwrap();
        assert_eq!(record.get("tier"), Some(&json!("premium")));
        assert!(record.get("reviewed").is_none());
        assert!(record.get("vip").is_none());
    }

    #[tokio::test]
    async fn test_all_matches_applies_in_priority_order() {
        let processor = TransformationProcessor::new();
        let mut ctx = TransformationContext::new();
        let cancel = CancellationToken::new();
        let batch = vec![DataRecord::from_value(json!({"amount": 200}))];
        let results = processor
            .process_with_rules(
                batch,
                &amount_rule_set(ExecutionStrategy::AllMatches, false),
                &mut ctx,
                &cancel,
            )
            .await;
        let record = results[0].record.as_ref().unwrap();
        assert_eq!(record.get("tier"), Some(&json!("premium")));
        assert_eq!(record.get("reviewed"), Some(&json!(true)));
        assert!(record.get("vip").is_none());
        // Priority order: tier written before reviewed.
        let names: Vec<&str> = record.field_names().collect();
        let tier_pos = names.iter().position(|n| *n == "tier").unwrap();
        let reviewed_pos = names.iter().position(|n| *n == "reviewed").unwrap();
        assert!(tier_pos < reviewed_pos);
    }

    #[tokio::test]
    async fn test_sequential_stop_on_first_match() {
        let processor = TransformationProcessor::new();
        let mut ctx = TransformationContext::new();
        let cancel = CancellationToken::new();
        let batch = vec![DataRecord::from_value(json!({"amount": 200}))];
        let results = processor
            .process_with_rules(
                batch,
                &amount_rule_set(ExecutionStrategy::Sequential, true),
                &mut ctx,
                &cancel,
            )
            .await;
        let record = results[0].record.as_ref().unwrap();
        assert_eq!(record.get("tier"), Some(&json!("premium")));
        assert!(record.get("reviewed").is_none());
    }

    #[tokio::test]
    async fn test_parallel_strategy_applies_all_matches() {
        let processor = TransformationProcessor::new();
        let mut ctx = TransformationContext::new();
        let cancel = CancellationToken::new();
        let batch = vec![DataRecord::from_value(json!({"amount": 200}))];
        let results = processor
            .process_with_rules(
                batch,
                &amount_rule_set(ExecutionStrategy::Parallel, false),
                &mut ctx,
                &cancel,
            )
            .await;
        let record = results[0].record.as_ref().unwrap();
        assert_eq!(record.get("tier"), Some(&json!("premium")));
        assert_eq!(record.get("reviewed"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_no_matching_rule_passes_record_through() {
        let processor = TransformationProcessor::new();
        let mut ctx = TransformationContext::new();
        let cancel = CancellationToken::new();
        let batch = vec![DataRecord::from_value(json!({"amount": 1}))];
        let results = processor
            .process_with_rules(
                batch,
                &amount_rule_set(ExecutionStrategy::Sequential, false),
                &mut ctx,
                &cancel,
            )
            .await;
        assert_eq!(results.len(), 1);
        let record = results[0].record.as_ref().unwrap();
        assert!(record.get("tier").is_none());
        assert_eq!(record.get("amount"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_custom_function_through_processor() {
        let mut processor = TransformationProcessor::new();
        processor.register_function("flag", |_| Ok(json!("flagged")));
        let mut ctx = TransformationContext::new();
        let cancel = CancellationToken::new();
        let transforms = vec![Transform::FieldMap {
            field_map: vec![FieldMapping {
                target: "status".to_string(),
                source: None,
                kind: MappingKind::Custom {
                    function: "flag".to_string(),
                },
                default: None,
            }],
        }];
        let results = processor
            .process_record(
                DataRecord::from_value(json!({})),
                &transforms,
                &mut ctx,
                &cancel,
            )
            .await;
        assert_eq!(
            results[0].record.as_ref().unwrap().get("status"),
            Some(&json!("flagged"))
        );
    }
}
