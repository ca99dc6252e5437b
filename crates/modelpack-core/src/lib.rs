//! modelpack core - headless pipeline that turns pretrained encoder models
//! into self-contained on-device packages.
//!
//! Each registry entry is materialized (weights + tokenizer), frozen into a
//! fixed-shape graph, lowered into a package program, optionally quantized,
//! and written atomically under the output root. The command surface lives
//! in the `modelpack-cli` crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use modelpack_core::{BatchOrchestrator, Registry, RunOptions};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> modelpack_core::Result<()> {
//!     let registry = Registry::load("models.yaml".as_ref())?;
//!     let mut orchestrator = BatchOrchestrator::new(registry, &RunOptions::new("output"))?;
//!
//!     let report = orchestrator.run(&[]).await;
//!     for result in &report.results {
//!         println!("{result}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod freeze;
pub mod graph;
pub mod lower;
pub mod materialize;
pub mod model;
pub mod pipeline;
pub mod quantize;
pub mod registry;
pub mod runtime;
pub mod writer;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use batch::{BatchOrchestrator, ConversionResult, Outcome, RunReport, RunState};
pub use config::{PathsConfig, PipelineConfig, RunOptions};
pub use error::{ConvertError, FailureKind, Result};
pub use freeze::{GraphFreezer, SampleInput};
pub use graph::{FrozenGraph, TensorSpec, TensorType};
pub use lower::{FormatLowerer, LoweredArtifact, LoweringContext, Manifest, TargetProfile};
pub use materialize::{MaterializedModel, ModelMaterializer, Preprocessor};
pub use pipeline::{EntryPipeline, Stage};
pub use quantize::WeightCompressor;
pub use registry::{ConversionSpec, ModelKind, Registry};
pub use runtime::{PackageRuntime, Prediction};
pub use writer::{ArtifactWriter, OutputRoot, WrittenPackage};
