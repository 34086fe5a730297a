//! Pipeline lifecycle events
//!
//! The orchestrator emits an event for every lifecycle transition. Publishers
//! are fire-and-forget: a publish failure is logged and never affects the
//! execution itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The execution started
    PipelineStarted,
    /// The execution completed successfully
    PipelineCompleted,
    /// The execution failed terminally
    PipelineFailed,
    /// The execution was cancelled or timed out
    PipelineCancelled,
    /// A stage started
    StageStarted,
    /// A stage completed
    StageCompleted,
    /// A stage failed after exhausting its retries
    StageFailed,
    /// A stage was skipped because its conditions did not hold
    StageSkipped,
    /// A stage attempt failed and a retry is scheduled
    StageRetrying,
    /// Progress: cumulative records moved through the pipeline so far
    DataProcessed,
}

/// One lifecycle event
#[derive(Debug, Clone, Serialize)]
pub struct PipelineEvent {
    /// Unique event id
    pub event_id: Uuid,
    /// Pipeline name
    pub pipeline: String,
    /// Execution this event belongs to
    pub execution_id: Uuid,
    /// When the event occurred
    pub at: DateTime<Utc>,
    /// What happened
    pub kind: EventKind,
    /// Kind-specific payload (stage name, counts, error text)
    pub metadata: Value,
    /// Optional caller-supplied correlation id
    pub correlation_id: Option<String>,
}

impl PipelineEvent {
    /// Build an event for the given execution
    pub fn new(
        pipeline: impl Into<String>,
        execution_id: Uuid,
        kind: EventKind,
        metadata: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            pipeline: pipeline.into(),
            execution_id,
            at: Utc::now(),
            kind,
            metadata,
            correlation_id: None,
        }
    }

    /// Attach a correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Sink for lifecycle events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event. Errors are logged by the caller, never propagated
    /// into the execution.
    async fn publish(&self, event: PipelineEvent) -> Result<()>;
}

/// Publisher that drops every event
#[derive(Debug, Default)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, _event: PipelineEvent) -> Result<()> {
        Ok(())
    }
}

/// Publisher that writes events to the tracing log
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        tracing::info!(
            pipeline = %event.pipeline,
            execution_id = %event.execution_id,
            kind = ?event.kind,
            metadata = %event.metadata,
            "pipeline event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_publisher_accepts_events() {
        let publisher = NoopPublisher;
        let event = PipelineEvent::new(
            "orders",
            Uuid::new_v4(),
            EventKind::PipelineStarted,
            json!({}),
        );
        assert!(publisher.publish(event).await.is_ok());
    }

    #[test]
    fn test_event_kind_serializes_snake_case() {
        let json = serde_json::to_string(&EventKind::StageRetrying).unwrap();
        assert_eq!(json, "\"stage_retrying\"");
    }

    #[test]
    fn test_correlation_id_builder() {
        let event = PipelineEvent::new("p", Uuid::new_v4(), EventKind::StageStarted, json!({}))
            .with_correlation_id("req-42");
        assert_eq!(event.correlation_id.as_deref(), Some("req-42"));
    }
}
