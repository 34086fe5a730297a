//! Pipeline and stage configuration
//!
//! Configuration objects are created by the loader, validated once, and
//! read-only during execution. The orchestrator re-checks the structural
//! invariants (unique stage orders, required handles per stage type) before
//! running anything.
//!
//! # Example
//!
//! ```yaml
//! name: orders_sync
//! error_handling:
//!   stop_on_error: false
//!   max_errors: 5
//! retry:
//!   max_attempts: 3
//!   delay_ms: 500
//! stages:
//!   - name: pull_orders
//!     type: extract
//!     order: 1
//!     connector: orders_source
//!   - name: shape_orders
//!     type: transform
//!     order: 2
//!     transforms:
//!       - drop:
//!           - internal_id
//!   - name: push_orders
//!     type: load
//!     order: 3
//!     connector: orders_sink
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::rules::{Condition, RuleSet};
use crate::transforms::Transform;

/// Kind of work a stage performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageType {
    /// Pull batches from a source connector
    Extract,
    /// Run records through the transformation processor
    Transform,
    /// Push batches to a destination connector
    Load,
    /// Delegate to a registered custom stage handler
    Custom,
}

impl std::fmt::Display for StageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Extract => write!(f, "extract"),
            Self::Transform => write!(f, "transform"),
            Self::Load => write!(f, "load"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Pipeline-level error policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// Abort the pipeline on the first stage failure
    #[serde(default)]
    pub stop_on_error: bool,

    /// Abort once accumulated context errors exceed this count
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            stop_on_error: false,
            max_errors: default_max_errors(),
        }
    }
}

fn default_max_errors() -> usize {
    100
}

/// Retry policy for transient stage failures
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first; 0 or 1 means no retries
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    1000
}

/// Configuration of one pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name (unique within the pipeline)
    pub name: String,

    /// Kind of work this stage performs
    #[serde(rename = "type")]
    pub stage_type: StageType,

    /// Execution order; unique, ascending across the pipeline
    pub order: u32,

    /// Disabled stages are filtered out before execution
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-stage timeout; a timeout cancels only this stage's work
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Per-stage retry override; falls back to the pipeline policy
    #[serde(default)]
    pub retry: Option<RetryConfig>,

    /// Execution conditions; all must hold or the stage is skipped
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Records per batch for extract stages
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Connector handle (required for extract and load stages)
    #[serde(default)]
    pub connector: Option<String>,

    /// Transform list (transform stages; mutually exclusive with `rules`)
    #[serde(default)]
    pub transforms: Option<Vec<Transform>>,

    /// Rule set (transform stages; mutually exclusive with `transforms`)
    #[serde(default)]
    pub rules: Option<RuleSet>,

    /// Registered handler name (required for custom stages)
    #[serde(default)]
    pub handler: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    100
}

/// Configuration of a whole pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Stages, in any declaration order; executed by ascending `order`
    #[serde(default)]
    pub stages: Vec<StageConfig>,

    /// Pipeline-level error policy
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,

    /// Default retry policy for stages without their own
    #[serde(default)]
    pub retry: RetryConfig,

    /// Overall execution timeout; elapsing reports the run as cancelled
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Upper bound on record-level parallelism within a transform stage
    #[serde(default)]
    pub max_parallelism: Option<usize>,
}

/// Outcome of validating a pipeline configuration
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    /// Whether the configuration may be executed
    pub is_valid: bool,
    /// Fatal problems
    pub errors: Vec<String>,
    /// Non-fatal observations
    pub warnings: Vec<String>,
}

impl PipelineConfig {
    /// Parse a pipeline configuration from YAML
    pub fn from_yaml(yaml: &str) -> crate::error::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Check the structural invariants the orchestrator relies on.
    ///
    /// Duplicate stage orders and missing per-type handles are errors; an
    /// empty pipeline or a no-retry policy is only a warning.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.stages.is_empty() {
            report.warnings.push("pipeline has no stages".to_string());
        }

        let mut seen_orders = HashSet::new();
        for stage in &self.stages {
            if !seen_orders.insert(stage.order) {
                report.errors.push(format!(
                    "duplicate stage order {} (stage '{}')",
                    stage.order, stage.name
                ));
            }
            if stage.batch_size == 0 {
                report
                    .errors
                    .push(format!("stage '{}': batch_size must be positive", stage.name));
            }

            match stage.stage_type {
                StageType::Extract | StageType::Load => {
                    if stage.connector.is_none() {
                        report.errors.push(format!(
                            "stage '{}': {} stages require a connector",
                            stage.name, stage.stage_type
                        ));
                    }
                }
                StageType::Transform => match (&stage.transforms, &stage.rules) {
                    (None, None) => report.errors.push(format!(
                        "stage '{}': transform stages require transforms or rules",
                        stage.name
                    )),
                    (Some(_), Some(_)) => report.errors.push(format!(
                        "stage '{}': transforms and rules are mutually exclusive",
                        stage.name
                    )),
                    _ => {}
                },
                StageType::Custom => {
                    if stage.handler.is_none() {
                        report.errors.push(format!(
                            "stage '{}': custom stages require a handler name",
                            stage.name
                        ));
                    }
                }
            }

            if let Some(retry) = &stage.retry {
                if retry.max_attempts == 0 {
                    report.warnings.push(format!(
                        "stage '{}': max_attempts 0 is treated as a single attempt",
                        stage.name
                    ));
                }
            }
        }

        report.is_valid = report.errors.is_empty();
        report
    }

    /// Enabled stages in execution order (ascending `order`)
    pub fn execution_order(&self) -> Vec<&StageConfig> {
        let mut stages: Vec<&StageConfig> = self.stages.iter().filter(|s| s.enabled).collect();
        stages.sort_by_key(|s| s.order);
        stages
    }

    /// Effective retry policy for a stage
    pub fn retry_for(&self, stage: &StageConfig) -> RetryConfig {
        stage.retry.unwrap_or(self.retry)
    }
}
