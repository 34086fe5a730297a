//! Execution outcomes
//!
//! An [`ExecutionResult`] is the durable record of one pipeline run: terminal
//! status, record counts, per-stage results and the retry delays that were
//! actually applied.

use chrono::{DateTime, Utc};
use fluxline_core::Statistics;
use serde::Serialize;
use uuid::Uuid;

/// Terminal (or in-flight) status of a pipeline execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Execution is still in flight
    Running,
    /// All stages completed
    Completed,
    /// At least one stage failed terminally or the error budget was spent
    Failed,
    /// Execution was cancelled or timed out before completing
    Cancelled,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one stage, after retries
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    /// Stage name
    pub stage: String,
    /// Records handed to the stage
    pub records_processed: u64,
    /// Records the stage handled successfully
    pub records_successful: u64,
    /// Records the stage failed on
    pub records_failed: u64,
    /// Batches the stage worked through
    pub batches: u64,
    /// Attempts spent, including the successful one
    pub attempts: u32,
}

/// The record of one pipeline execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Unique execution id, shared with the transformation context
    pub execution_id: Uuid,
    /// Name of the executed pipeline
    pub pipeline: String,
    /// Terminal status
    pub status: ExecutionStatus,
    /// When the execution started
    pub started_at: DateTime<Utc>,
    /// When the execution finished, once it has
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Records read into the pipeline by extract stages
    pub records_processed: u64,
    /// Records that transformed successfully
    pub records_successful: u64,
    /// Records that failed
    pub records_failed: u64,
    /// Terminal error, if the execution failed
    pub error_message: Option<String>,
    /// Every retry backoff delay applied, in order, in milliseconds
    pub retry_delays_ms: Vec<u64>,
    /// Per-stage outcomes in execution order
    pub stages: Vec<StageResult>,
    /// Aggregated transformation statistics
    pub stats: Statistics,
}

impl ExecutionResult {
    /// Start a new in-flight result
    pub fn begin(execution_id: Uuid, pipeline: impl Into<String>) -> Self {
        Self {
            execution_id,
            pipeline: pipeline.into(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            records_processed: 0,
            records_successful: 0,
            records_failed: 0,
            error_message: None,
            retry_delays_ms: Vec::new(),
            stages: Vec::new(),
            stats: Statistics::default(),
        }
    }

    /// Mark the execution finished with the given status
    pub fn finish(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
    }

    /// Whether the execution reached a successful terminal state
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_sets_terminal_fields() {
        let mut result = ExecutionResult::begin(Uuid::new_v4(), "orders");
        assert_eq!(result.status, ExecutionStatus::Running);
        assert!(result.finished_at.is_none());

        result.finish(ExecutionStatus::Completed);
        assert!(result.is_success());
        assert!(result.finished_at.is_some());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ExecutionStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        assert_eq!(ExecutionStatus::Failed.to_string(), "failed");
    }
}
