//! Fluxline Runtime
//!
//! This crate provides the execution runtime for Fluxline pipelines.
//! It's designed to be minimal for small Docker images.
//!
//! # Features
//!
//! - Stage execution (extract, transform, load, custom)
//! - Pipeline orchestration with retries, timeouts and cancellation
//! - Lifecycle event publishing
//!
//! # Usage
//!
//! ```rust,ignore
//! use fluxline_runtime::PipelineOrchestrator;
//!
//! let orchestrator = PipelineOrchestrator::new(provider);
//! let result = orchestrator.execute(&config, params, cancel).await;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod result;

pub use error::{Error, Result};
pub use events::{EventKind, EventPublisher, LogPublisher, NoopPublisher, PipelineEvent};
pub use executor::{CustomStageHandler, StageExecutor, StageOutput};
pub use orchestrator::PipelineOrchestrator;
pub use result::{ExecutionResult, ExecutionStatus, StageResult};
