//! Fluxline Core Library
//!
//! This crate provides the core building blocks for Fluxline pipelines:
//! - Pipeline and stage configuration parsing and validation
//! - Field mappings, transforms and the rule engine
//! - The transformation processor (sequential and parallel batch processing)
//! - Connector contracts and file connectors for local development
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌─────────────┐
//! │   Source    │────▶│  Transformation  │────▶│ Destination │
//! │  Connector  │     │    Processor     │     │  Connector  │
//! └─────────────┘     └──────────────────┘     └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use fluxline_core::{PipelineConfig, TransformationProcessor};
//!
//! let config = PipelineConfig::from_yaml(&yaml)?;
//! let report = config.validate();
//! assert!(report.is_valid);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connectors;
pub mod context;
pub mod error;
pub mod expr;
pub mod mapping;
pub mod processor;
pub mod record;
pub mod rules;
pub mod transforms;

pub use config::{PipelineConfig, StageConfig, StageType};
pub use context::{Statistics, TransformationContext};
pub use error::{Error, Result};
pub use processor::{TransformationProcessor, TransformationResult};
pub use record::{Batch, DataRecord};
pub use rules::{Condition, Rule, RuleSet};
pub use transforms::Transform;
