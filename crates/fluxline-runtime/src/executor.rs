//! Stage executor
//!
//! Runs one stage attempt against the in-flight dataset. Extract stages pull
//! batches from a source connector, transform stages run the transformation
//! processor, load stages push batches to a destination connector, custom
//! stages dispatch to a registered handler. Retry policy lives in the
//! orchestrator; an attempt here is always a clean run.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fluxline_core::connectors::ConnectorProvider;
use fluxline_core::error::Error as CoreError;
use fluxline_core::{
    Batch, DataRecord, StageConfig, StageType, TransformationContext, TransformationProcessor,
};
use tokio_util::sync::CancellationToken;

use crate::result::StageResult;

/// Handler for `custom` stages. Receives the whole in-flight dataset and
/// returns the dataset handed to the next stage.
#[async_trait]
pub trait CustomStageHandler: Send + Sync {
    /// Run the stage over the dataset
    async fn run(
        &self,
        stage: &StageConfig,
        records: Batch,
        ctx: &mut TransformationContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Batch>;
}

/// Dataset and accounting produced by one successful stage attempt
pub struct StageOutput {
    /// Records handed to the next stage
    pub records: Vec<DataRecord>,
    /// Stage accounting (attempts are filled in by the orchestrator)
    pub result: StageResult,
}

/// Executes single stage attempts
pub struct StageExecutor {
    processor: TransformationProcessor,
    handlers: HashMap<String, Arc<dyn CustomStageHandler>>,
}

impl StageExecutor {
    /// Create an executor around a transformation processor
    pub fn new(processor: TransformationProcessor) -> Self {
        Self {
            processor,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for `custom` stages that name it
    pub fn register_handler(&mut self, name: impl Into<String>, handler: Arc<dyn CustomStageHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// The executor's transformation processor
    pub fn processor_mut(&mut self) -> &mut TransformationProcessor {
        &mut self.processor
    }

    /// Run one attempt of `stage` over `records`.
    ///
    /// Errors are [`fluxline_core::Error`] values wrapped in `anyhow`, so the
    /// caller can inspect transience for retry decisions.
    pub async fn execute(
        &self,
        stage: &StageConfig,
        provider: &dyn ConnectorProvider,
        records: Vec<DataRecord>,
        ctx: &mut TransformationContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StageOutput> {
        match stage.stage_type {
            StageType::Extract => self.execute_extract(stage, provider, records, cancel).await,
            StageType::Transform => self.execute_transform(stage, records, ctx, cancel).await,
            StageType::Load => self.execute_load(stage, provider, records, cancel).await,
            StageType::Custom => self.execute_custom(stage, records, ctx, cancel).await,
        }
    }

    /// Pull every batch from the stage's source connector and append the
    /// records to the dataset.
    async fn execute_extract(
        &self,
        stage: &StageConfig,
        provider: &dyn ConnectorProvider,
        mut records: Vec<DataRecord>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StageOutput> {
        let handle = require_handle(stage, stage.connector.as_deref(), "connector")?;
        let mut source = provider.source(handle)?;

        let mut read = 0u64;
        let mut batches = 0u64;
        while let Some(batch) = source.read_batch(stage.batch_size, cancel).await? {
            read += batch.len() as u64;
            batches += 1;
            records.extend(batch);
            if cancel.is_cancelled() {
                break;
            }
        }
        tracing::debug!(stage = %stage.name, records = read, batches, "extract finished");

        Ok(StageOutput {
            records,
            result: StageResult {
                stage: stage.name.clone(),
                records_processed: read,
                records_successful: read,
                records_failed: 0,
                batches,
                attempts: 1,
            },
        })
    }

    /// Run the stage's transforms or rule set over the dataset, one
    /// configured batch at a time.
    async fn execute_transform(
        &self,
        stage: &StageConfig,
        records: Vec<DataRecord>,
        ctx: &mut TransformationContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StageOutput> {
        let input = records.len() as u64;
        let mut output = Vec::with_capacity(records.len());
        let mut successful = 0u64;
        let mut failed = 0u64;
        let mut batches = 0u64;

        let batch_size = stage.batch_size.max(1);
        let mut remaining = records;
        while !remaining.is_empty() && !cancel.is_cancelled() {
            let rest = remaining.split_off(remaining.len().min(batch_size));
            let chunk = std::mem::replace(&mut remaining, rest);
            batches += 1;

            let results = if let Some(rules) = &stage.rules {
                self.processor
                    .process_with_rules(chunk, rules, ctx, cancel)
                    .await
            } else if let Some(transforms) = &stage.transforms {
                self.processor
                    .process_records(chunk, transforms, ctx, cancel)
                    .await
            } else {
                // Validation rejects this; treat it as a passthrough.
                chunk
                    .into_iter()
                    .map(fluxline_core::TransformationResult::success)
                    .collect()
            };

            for result in results {
                if result.success {
                    successful += 1;
                    if let Some(record) = result.record {
                        output.push(record);
                    }
                } else {
                    failed += 1;
                }
            }
        }
        tracing::debug!(
            stage = %stage.name,
            input,
            output = output.len(),
            failed,
            "transform finished"
        );

        Ok(StageOutput {
            records: output,
            result: StageResult {
                stage: stage.name.clone(),
                records_processed: input,
                records_successful: successful,
                records_failed: failed,
                batches,
                attempts: 1,
            },
        })
    }

    /// Push the dataset to the stage's destination connector in configured
    /// batches. The dataset passes through unchanged.
    async fn execute_load(
        &self,
        stage: &StageConfig,
        provider: &dyn ConnectorProvider,
        records: Vec<DataRecord>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StageOutput> {
        let handle = require_handle(stage, stage.connector.as_deref(), "connector")?;
        let mut sink = provider.sink(handle)?;

        let mut written = 0u64;
        let mut batches = 0u64;
        let batch_size = stage.batch_size.max(1);
        for chunk in records.chunks(batch_size) {
            if cancel.is_cancelled() {
                break;
            }
            let batch: Batch = chunk.to_vec();
            let result = sink.write_batch(&batch, cancel).await?;
            if !result.successful {
                return Err(CoreError::Connector {
                    connector: handle.to_string(),
                    operation: fluxline_core::error::ConnectorOperation::Write,
                    message: result
                        .message
                        .unwrap_or_else(|| "write rejected".to_string()),
                    transient: true,
                }
                .into());
            }
            written += result.records_written;
            batches += 1;
        }
        tracing::debug!(stage = %stage.name, written, batches, "load finished");

        Ok(StageOutput {
            result: StageResult {
                stage: stage.name.clone(),
                records_processed: records.len() as u64,
                records_successful: written,
                records_failed: 0,
                batches,
                attempts: 1,
            },
            records,
        })
    }

    async fn execute_custom(
        &self,
        stage: &StageConfig,
        records: Vec<DataRecord>,
        ctx: &mut TransformationContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StageOutput> {
        let name = require_handle(stage, stage.handler.as_deref(), "handler")?;
        let handler = self.handlers.get(name).ok_or_else(|| CoreError::Execution {
            stage: stage.name.clone(),
            message: format!("no handler registered under '{name}'"),
            record_index: None,
        })?;

        let input = records.len() as u64;
        let output = handler
            .run(stage, records, ctx, cancel)
            .await
            .map_err(|e| CoreError::Execution {
                stage: stage.name.clone(),
                message: e.to_string(),
                record_index: None,
            })?;

        Ok(StageOutput {
            result: StageResult {
                stage: stage.name.clone(),
                records_processed: input,
                records_successful: output.len() as u64,
                records_failed: 0,
                batches: 1,
                attempts: 1,
            },
            records: output,
        })
    }
}

fn require_handle<'a>(
    stage: &StageConfig,
    handle: Option<&'a str>,
    what: &str,
) -> anyhow::Result<&'a str> {
    handle.ok_or_else(|| {
        CoreError::Execution {
            stage: stage.name.clone(),
            message: format!("stage has no {what}"),
            record_index: None,
        }
        .into()
    })
}
