//! Error types for fluxline-core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for fluxline-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Connector operation that was in flight when a connector error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorOperation {
    /// Reading batches from a source
    Read,
    /// Writing batches to a destination
    Write,
    /// Establishing the connection
    Connect,
}

impl std::fmt::Display for ConnectorOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Connect => write!(f, "connect"),
        }
    }
}

/// Errors that can occur in fluxline-core
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid pipeline or stage configuration (fatal, pre-execution)
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Description of what's invalid
        message: String,
    },

    /// Connector failure, tagged with the operation in flight
    #[error("connector '{connector}' {operation} error: {message}")]
    Connector {
        /// Name of the connector
        connector: String,
        /// Operation that failed
        operation: ConnectorOperation,
        /// Description of the error
        message: String,
        /// Whether the failure is worth retrying
        transient: bool,
    },

    /// Field or record level transformation failure
    #[error("transformation '{transformation}' error: {message}")]
    Transformation {
        /// Id of the transformation that failed
        transformation: String,
        /// Index of the record in flight, if known
        record_index: Option<u64>,
        /// Field being written, if known
        field: Option<String>,
        /// Description of the error
        message: String,
    },

    /// Stage level execution failure
    #[error("stage '{stage}' failed: {message}")]
    Execution {
        /// Name of the stage
        stage: String,
        /// Description of the error
        message: String,
        /// Record number in flight when it occurred, if known
        record_index: Option<u64>,
    },

    /// Stage attempt exceeded its configured timeout
    #[error("stage '{stage}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Name of the stage
        stage: String,
        /// The configured bound in milliseconds
        timeout_ms: u64,
    },

    /// Expression compilation or evaluation error
    #[error("expression error: {0}")]
    Expression(#[from] minijinja::Error),

    /// Invalid regex pattern
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Failed to parse YAML configuration
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Shorthand for a transformation error without positional tags
    pub fn transformation(transformation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transformation {
            transformation: transformation.into(),
            record_index: None,
            field: None,
            message: message.into(),
        }
    }

    /// Whether a stage that surfaced this error is eligible for retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connector { transient, .. } => *transient,
            Self::Timeout { .. } => true,
            Self::Configuration { .. } => false,
            Self::Io(_) => true,
            _ => false,
        }
    }
}
