//! Pipeline orchestrator
//!
//! Drives a pipeline execution end to end: validates the configuration,
//! walks the enabled stages in order, applies retry policy with recorded
//! delays, enforces the error budget and the overall timeout, and emits
//! lifecycle events along the way.
//!
//! Cancellation and timeout produce a `Cancelled` result, which is terminal
//! and never retried. Stage failures produce `Failed` once retries are
//! exhausted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fluxline_core::connectors::ConnectorProvider;
use fluxline_core::error::Error as CoreError;
use fluxline_core::{
    DataRecord, PipelineConfig, StageConfig, StageType, TransformationContext,
    TransformationProcessor,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::events::{EventKind, EventPublisher, NoopPublisher, PipelineEvent};
use crate::executor::{CustomStageHandler, StageExecutor, StageOutput};
use crate::result::{ExecutionResult, ExecutionStatus, StageResult};

/// Executes pipeline configurations against a connector provider
pub struct PipelineOrchestrator {
    executor: StageExecutor,
    provider: Arc<dyn ConnectorProvider>,
    publisher: Arc<dyn EventPublisher>,
}

impl PipelineOrchestrator {
    /// Create an orchestrator with a default processor and no event sink
    pub fn new(provider: Arc<dyn ConnectorProvider>) -> Self {
        Self {
            executor: StageExecutor::new(TransformationProcessor::new()),
            provider,
            publisher: Arc::new(NoopPublisher),
        }
    }

    /// Replace the transformation processor
    pub fn with_processor(mut self, processor: TransformationProcessor) -> Self {
        self.executor = StageExecutor::new(processor);
        self
    }

    /// Attach an event publisher
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Register a handler for `custom` stages
    pub fn register_handler(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn CustomStageHandler>,
    ) {
        self.executor.register_handler(name, handler);
    }

    /// Register a custom value function for `custom` mappings
    pub fn register_function(
        &mut self,
        name: impl Into<String>,
        function: impl Fn(&DataRecord) -> fluxline_core::Result<Value> + Send + Sync + 'static,
    ) {
        self.executor.processor_mut().register_function(name, function);
    }

    /// Execute a pipeline to completion, cancellation or failure.
    ///
    /// `parameters` become expression variables for the whole execution.
    /// Cancelling `cancel` (or exceeding the pipeline timeout) stops the
    /// execution at the next safe point with status `Cancelled`.
    pub async fn execute(
        &self,
        config: &PipelineConfig,
        parameters: HashMap<String, Value>,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let mut ctx = TransformationContext::with_variables(parameters);
        let mut result = ExecutionResult::begin(ctx.execution_id, &config.name);

        let report = config.validate();
        if !report.is_valid {
            result.error_message = Some(format!("invalid pipeline: {}", report.errors.join("; ")));
            result.finish(ExecutionStatus::Failed);
            self.emit(config, &ctx, EventKind::PipelineFailed, json!({
                "errors": report.errors,
            }))
            .await;
            return result;
        }
        for warning in &report.warnings {
            tracing::warn!(pipeline = %config.name, warning = %warning, "pipeline validation warning");
        }

        // Timeout shares the cancellation path; the watchdog is aborted on
        // any exit from this function.
        let exec_cancel = cancel.child_token();
        let watchdog = config.timeout_ms.map(|ms| {
            let token = exec_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                tracing::warn!(timeout_ms = ms, "pipeline timeout reached, cancelling");
                token.cancel();
            })
        });

        self.emit(config, &ctx, EventKind::PipelineStarted, json!({})).await;
        tracing::info!(pipeline = %config.name, execution_id = %ctx.execution_id, "pipeline started");

        let mut records: Vec<DataRecord> = Vec::new();
        let mut status = ExecutionStatus::Running;

        for stage in config.execution_order() {
            if exec_cancel.is_cancelled() {
                status = ExecutionStatus::Cancelled;
                break;
            }

            match self.stage_applies(stage, &ctx) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(stage = %stage.name, "stage skipped, conditions not met");
                    self.emit(config, &ctx, EventKind::StageSkipped, json!({
                        "stage": stage.name,
                    }))
                    .await;
                    continue;
                }
                Err(e) => {
                    result.error_message =
                        Some(format!("stage '{}' condition error: {e}", stage.name));
                    status = ExecutionStatus::Failed;
                    break;
                }
            }

            self.emit(config, &ctx, EventKind::StageStarted, json!({
                "stage": stage.name,
            }))
            .await;

            match self
                .run_stage_with_retry(config, stage, &records, &mut ctx, &mut result, &exec_cancel)
                .await
            {
                StageOutcome::Completed(output) => {
                    records = output.records;
                    if exec_cancel.is_cancelled() {
                        // The stage stopped early at the token; keep its
                        // counts but do not announce completion for a run
                        // that is about to report Cancelled.
                        result.stages.push(output.result);
                        status = ExecutionStatus::Cancelled;
                        break;
                    }
                    self.emit(config, &ctx, EventKind::StageCompleted, json!({
                        "stage": stage.name,
                        "records": output.result.records_processed,
                        "attempts": output.result.attempts,
                    }))
                    .await;
                    self.emit(config, &ctx, EventKind::DataProcessed, json!({
                        "stage": stage.name,
                        "records_in_flight": records.len() as u64,
                        "records_processed": ctx.stats.records_processed,
                    }))
                    .await;
                    result.stages.push(output.result);
                }
                StageOutcome::Cancelled => {
                    status = ExecutionStatus::Cancelled;
                    break;
                }
                StageOutcome::Failed { stage_result, error } => {
                    ctx.add_error(None, None, Some(stage.name.clone()), error.clone());
                    result.error_message = Some(error.clone());
                    result.stages.push(stage_result);
                    status = ExecutionStatus::Failed;
                    self.emit(config, &ctx, EventKind::StageFailed, json!({
                        "stage": stage.name,
                        "error": error,
                    }))
                    .await;
                    if config.error_handling.stop_on_error {
                        break;
                    }
                }
            }

            if ctx.error_count() > config.error_handling.max_errors {
                result.error_message = Some(format!(
                    "error budget exceeded: {} errors recorded, at most {} allowed",
                    ctx.error_count(),
                    config.error_handling.max_errors
                ));
                status = ExecutionStatus::Failed;
                break;
            }
        }

        if let Some(handle) = watchdog {
            handle.abort();
        }

        if exec_cancel.is_cancelled() && status != ExecutionStatus::Failed {
            status = ExecutionStatus::Cancelled;
        }
        if status == ExecutionStatus::Running {
            status = ExecutionStatus::Completed;
        }

        result.records_processed = stage_totals(config, &result.stages, StageType::Extract)
            .map(|s| s.records_processed)
            .sum();
        // Without a transform stage there is nothing in the transformation
        // statistics; the widest load is then the success count.
        let transform_ran = stage_totals(config, &result.stages, StageType::Transform)
            .next()
            .is_some();
        result.records_successful = if transform_ran {
            ctx.stats.records_transformed
        } else {
            stage_totals(config, &result.stages, StageType::Load)
                .map(|s| s.records_successful)
                .max()
                .unwrap_or(0)
        };
        result.records_failed = ctx.stats.records_failed;
        result.stats = ctx.stats.clone();
        result.finish(status);

        let terminal = match status {
            ExecutionStatus::Completed => EventKind::PipelineCompleted,
            ExecutionStatus::Cancelled => EventKind::PipelineCancelled,
            _ => EventKind::PipelineFailed,
        };
        self.emit(config, &ctx, terminal, json!({
            "status": status.to_string(),
            "duration_ms": result.duration_ms,
            "records_processed": result.records_processed,
        }))
        .await;
        tracing::info!(
            pipeline = %config.name,
            execution_id = %ctx.execution_id,
            status = %status,
            duration_ms = result.duration_ms,
            "pipeline finished"
        );

        result
    }

    /// Evaluate stage conditions against an empty probe record; variables
    /// and expression conditions still see the execution parameters.
    fn stage_applies(
        &self,
        stage: &StageConfig,
        ctx: &TransformationContext,
    ) -> fluxline_core::Result<bool> {
        let probe = DataRecord::new();
        for condition in &stage.conditions {
            if !condition.evaluate(&probe, ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn run_stage_with_retry(
        &self,
        config: &PipelineConfig,
        stage: &StageConfig,
        records: &[DataRecord],
        ctx: &mut TransformationContext,
        result: &mut ExecutionResult,
        exec_cancel: &CancellationToken,
    ) -> StageOutcome {
        let retry = config.retry_for(stage);
        let max_attempts = retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            // Every attempt runs against a clean copy of the dataset.
            let input = records.to_vec();

            let error = match self.run_attempt(stage, input, ctx, exec_cancel).await {
                Ok(mut output) => {
                    output.result.attempts = attempt;
                    return StageOutcome::Completed(output);
                }
                Err(e) => e,
            };

            if exec_cancel.is_cancelled() {
                return StageOutcome::Cancelled;
            }

            let retryable = is_retryable(&error);
            if attempt < max_attempts && retryable {
                tracing::warn!(
                    stage = %stage.name,
                    attempt,
                    max_attempts,
                    delay_ms = retry.delay_ms,
                    error = %error,
                    "stage attempt failed, retrying"
                );
                self.emit(config, ctx, EventKind::StageRetrying, json!({
                    "stage": stage.name,
                    "attempt": attempt,
                    "delay_ms": retry.delay_ms,
                    "error": error.to_string(),
                }))
                .await;
                result.retry_delays_ms.push(retry.delay_ms);

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(retry.delay_ms)) => {}
                    _ = exec_cancel.cancelled() => return StageOutcome::Cancelled,
                }
                continue;
            }

            let reason = if retryable {
                format!("stage '{}' failed after {attempt} attempts: {error}", stage.name)
            } else {
                format!("stage '{}' failed: {error}", stage.name)
            };
            return StageOutcome::Failed {
                stage_result: StageResult {
                    stage: stage.name.clone(),
                    records_processed: records.len() as u64,
                    records_successful: 0,
                    records_failed: 0,
                    batches: 0,
                    attempts: attempt,
                },
                error: reason,
            };
        }

        // max_attempts >= 1, the loop always returns.
        unreachable!("retry loop exits via return")
    }

    /// One stage attempt, bounded by the stage timeout when configured.
    /// A timed-out attempt cancels its own token so connectors unwind, and
    /// reports a transient error.
    async fn run_attempt(
        &self,
        stage: &StageConfig,
        records: Vec<DataRecord>,
        ctx: &mut TransformationContext,
        exec_cancel: &CancellationToken,
    ) -> anyhow::Result<StageOutput> {
        let stage_cancel = exec_cancel.child_token();
        match stage.timeout_ms {
            None => {
                self.executor
                    .execute(stage, self.provider.as_ref(), records, ctx, &stage_cancel)
                    .await
            }
            Some(ms) => {
                let attempt = self
                    .executor
                    .execute(stage, self.provider.as_ref(), records, ctx, &stage_cancel);
                match tokio::time::timeout(Duration::from_millis(ms), attempt).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        stage_cancel.cancel();
                        Err(CoreError::Timeout {
                            stage: stage.name.clone(),
                            timeout_ms: ms,
                        }
                        .into())
                    }
                }
            }
        }
    }

    async fn emit(
        &self,
        config: &PipelineConfig,
        ctx: &TransformationContext,
        kind: EventKind,
        metadata: Value,
    ) {
        let event = PipelineEvent::new(&config.name, ctx.execution_id, kind, metadata);
        if let Err(e) = self.publisher.publish(event).await {
            tracing::warn!(error = %e, "event publisher failed, continuing");
        }
    }
}

enum StageOutcome {
    Completed(StageOutput),
    Cancelled,
    Failed {
        stage_result: StageResult,
        error: String,
    },
}

/// Whether a failed attempt may be retried. Transience is decided by the
/// core error taxonomy; anything else is treated as permanent.
fn is_retryable(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<CoreError>()
        .map(CoreError::is_transient)
        .unwrap_or(false)
}

/// Executed stage results belonging to stages of the given type
fn stage_totals<'a>(
    config: &'a PipelineConfig,
    stages: &'a [StageResult],
    stage_type: StageType,
) -> impl Iterator<Item = &'a StageResult> {
    let names: std::collections::HashSet<&str> = config
        .stages
        .iter()
        .filter(|s| s.stage_type == stage_type)
        .map(|s| s.name.as_str())
        .collect();
    stages.iter().filter(move |s| names.contains(s.stage.as_str()))
}
