//! Per-execution mutable state
//!
//! A [`TransformationContext`] is created once per pipeline execution and
//! discarded at the end. During parallel fan-out each record is processed
//! against its own child context, which inherits configuration and variables
//! but owns independent statistics that are absorbed back into the parent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Aggregate counters for one execution.
///
/// All counters are non-negative and monotonically non-decreasing within a
/// single execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Statistics {
    /// Records handed to the transformation processor
    pub records_processed: u64,
    /// Records that produced at least one transformed output
    pub records_transformed: u64,
    /// Records whose lineage terminated without output (filtered)
    pub records_skipped: u64,
    /// Records that failed transformation
    pub records_failed: u64,
    /// Individual field writes performed by mappings
    pub fields_transformed: u64,
    /// Total processing time across records, in milliseconds
    pub processing_time_ms: u64,
    /// Peak memory attributed to the execution, in bytes, when a caller
    /// reports it. Never decreases within one execution.
    pub memory_used_bytes: u64,
    /// Free-form named metrics
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, f64>,
}

impl Statistics {
    /// Fold another statistics block into this one
    pub fn merge(&mut self, other: &Statistics) {
        self.records_processed += other.records_processed;
        self.records_transformed += other.records_transformed;
        self.records_skipped += other.records_skipped;
        self.records_failed += other.records_failed;
        self.fields_transformed += other.fields_transformed;
        self.processing_time_ms += other.processing_time_ms;
        self.memory_used_bytes = self.memory_used_bytes.max(other.memory_used_bytes);
        for (name, value) in &other.custom {
            *self.custom.entry(name.clone()).or_default() += value;
        }
    }
}

/// One recorded error or warning, tagged with its position in the stream
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingIssue {
    /// Index of the record in flight, if known
    pub record_index: Option<u64>,
    /// Field being written, if known
    pub field: Option<String>,
    /// Id of the transformation involved, if any
    pub transformation: Option<String>,
    /// Human-readable description
    pub message: String,
    /// When the issue was recorded
    pub at: DateTime<Utc>,
}

/// Mutable per-execution state: counters, issues, variables, record cursor
#[derive(Debug, Clone)]
pub struct TransformationContext {
    /// Unique id of the execution this context belongs to
    pub execution_id: Uuid,
    /// When the execution started
    pub started_at: DateTime<Utc>,
    /// Execution statistics
    pub stats: Statistics,
    /// Variables visible to expression conditions and templates
    pub variables: HashMap<String, Value>,
    /// Free-form metadata carried alongside the execution
    pub metadata: HashMap<String, Value>,
    /// Ordered list of recorded errors
    pub errors: Vec<ProcessingIssue>,
    /// Ordered list of recorded warnings
    pub warnings: Vec<ProcessingIssue>,
    // Shared across children so indices stay unique under fan-out.
    record_cursor: Arc<AtomicU64>,
}

impl Default for TransformationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformationContext {
    /// Create a fresh context for a new execution
    pub fn new() -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            started_at: Utc::now(),
            stats: Statistics::default(),
            variables: HashMap::new(),
            metadata: HashMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            record_cursor: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a context seeded with execution parameters
    pub fn with_variables(variables: HashMap<String, Value>) -> Self {
        Self {
            variables,
            ..Self::new()
        }
    }

    /// Claim the next record index. Thread safe; shared with child contexts.
    pub fn next_record_index(&self) -> u64 {
        self.record_cursor.fetch_add(1, Ordering::Relaxed)
    }

    /// Current value of the record cursor
    pub fn current_record_index(&self) -> u64 {
        self.record_cursor.load(Ordering::Relaxed)
    }

    /// Create a per-record child context for parallel fan-out.
    ///
    /// The child shares the execution id, start time, record cursor,
    /// variables and metadata, but owns zeroed statistics and empty issue
    /// lists so concurrent units never contend on the parent.
    pub fn child(&self) -> Self {
        Self {
            execution_id: self.execution_id,
            started_at: self.started_at,
            stats: Statistics::default(),
            variables: self.variables.clone(),
            metadata: self.metadata.clone(),
            errors: Vec::new(),
            warnings: Vec::new(),
            record_cursor: Arc::clone(&self.record_cursor),
        }
    }

    /// Merge a child context's statistics and issues back into this one
    pub fn absorb(&mut self, child: TransformationContext) {
        self.stats.merge(&child.stats);
        self.errors.extend(child.errors);
        self.warnings.extend(child.warnings);
    }

    /// Record an error tagged with its stream position
    pub fn add_error(
        &mut self,
        record_index: Option<u64>,
        field: Option<String>,
        transformation: Option<String>,
        message: impl Into<String>,
    ) {
        self.errors.push(ProcessingIssue {
            record_index,
            field,
            transformation,
            message: message.into(),
            at: Utc::now(),
        });
    }

    /// Record a warning tagged with its stream position
    pub fn add_warning(
        &mut self,
        record_index: Option<u64>,
        field: Option<String>,
        message: impl Into<String>,
    ) {
        self.warnings.push(ProcessingIssue {
            record_index,
            field,
            transformation: None,
            message: message.into(),
            at: Utc::now(),
        });
    }

    /// Number of errors recorded so far
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}
