//! Conversion of one registry entry, stage by stage.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{PathsConfig, PipelineConfig};
use crate::error::ConvertError;
use crate::freeze::GraphFreezer;
use crate::lower::{FormatLowerer, LoweringContext};
use crate::materialize::ModelMaterializer;
use crate::quantize::WeightCompressor;
use crate::registry::ConversionSpec;
use crate::runtime::PackageRuntime;
use crate::writer::{ArtifactWriter, WrittenPackage};

/// Pipeline stage an entry is in, or failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Registry lookup before any work starts.
    Resolving,
    Materializing,
    Freezing,
    Lowering,
    Compressing,
    Writing,
    /// Reloading the written package (`--verify` only).
    Verifying,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Resolving => "resolving",
            Stage::Materializing => "materializing",
            Stage::Freezing => "freezing",
            Stage::Lowering => "lowering",
            Stage::Compressing => "compressing",
            Stage::Writing => "writing",
            Stage::Verifying => "verifying",
        };
        f.write_str(name)
    }
}

/// Successful conversion of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Converted {
    pub package: WrittenPackage,
    pub quantized_bits: Option<u32>,
}

/// Why an entry stopped, and where.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: ConvertError,
    /// Unquantized package written after a compression failure.
    pub fallback: Option<WrittenPackage>,
}

impl StageFailure {
    fn at(stage: Stage) -> impl FnOnce(ConvertError) -> StageFailure {
        move |error| StageFailure {
            stage,
            error,
            fallback: None,
        }
    }
}

/// Runs every stage for one entry against shared run resources.
pub struct EntryPipeline<'a> {
    materializer: &'a ModelMaterializer,
    writer: &'a ArtifactWriter,
    verify: bool,
}

impl<'a> EntryPipeline<'a> {
    pub fn new(materializer: &'a ModelMaterializer, writer: &'a ArtifactWriter, verify: bool) -> Self {
        Self {
            materializer,
            writer,
            verify,
        }
    }

    pub async fn convert(
        &self,
        name: &str,
        spec: &ConversionSpec,
    ) -> std::result::Result<Converted, StageFailure> {
        info!("[{}] materializing {}", name, spec.source);
        let model = self
            .materializer
            .materialize(spec)
            .await
            .map_err(StageFailure::at(Stage::Materializing))?;

        info!("[{}] freezing at max_length {}", name, spec.max_length);
        let (graph, _sample) = GraphFreezer::freeze(&model, spec.max_length)
            .map_err(StageFailure::at(Stage::Freezing))?;

        info!("[{}] lowering", name);
        let ctx = LoweringContext {
            name: &spec.output_name,
            spec,
            model_type: &model.config.model_type,
            pad_token_id: model.config.pad_id(),
            tokenizer_json: model.preprocessor.json(),
        };
        let mut artifact =
            FormatLowerer::lower(&graph, &ctx).map_err(StageFailure::at(Stage::Lowering))?;
        drop(graph);
        drop(model);

        if let Some(bits) = spec.quantize_bits {
            info!("[{}] compressing to {} bits", name, bits);
        }
        if let Err(error) = WeightCompressor::compress(&mut artifact, spec.quantize_bits) {
            let fallback_name = format!("{}{}", spec.output_name, PathsConfig::FALLBACK_SUFFIX);
            warn!("[{}] {}; writing unquantized fallback {}", name, error, fallback_name);
            let fallback = match self.writer.write(&artifact, &fallback_name) {
                Ok(written) => Some(written),
                Err(e) => {
                    warn!("[{}] fallback write failed: {}", name, e);
                    None
                }
            };
            return Err(StageFailure {
                stage: Stage::Compressing,
                error,
                fallback,
            });
        }

        info!("[{}] writing {}", name, spec.output_name);
        let package = self
            .writer
            .write(&artifact, &spec.output_name)
            .map_err(StageFailure::at(Stage::Writing))?;
        drop(artifact);

        if self.verify {
            info!("[{}] verifying {}", name, package.path.display());
            verify_package(&package).map_err(StageFailure::at(Stage::Verifying))?;
        }

        Ok(Converted {
            package,
            quantized_bits: spec.quantize_bits,
        })
    }
}

/// Load the package and run the probe text through it.
pub fn verify_package(package: &WrittenPackage) -> crate::error::Result<()> {
    let runtime = PackageRuntime::load(&package.path)?;
    let prediction = runtime.predict_text(PipelineConfig::PROBE_TEXT)?;
    for spec in &runtime.manifest().outputs {
        let produced = prediction
            .outputs
            .get(&spec.name)
            .map(|out| out.shape.as_slice());
        if produced != Some(spec.shape.as_slice()) {
            return Err(ConvertError::runtime(format!(
                "output {} does not have its declared shape {:?}",
                spec.name, spec.shape
            )));
        }
        if let Some(out) = prediction.outputs.get(&spec.name) {
            if out.data.iter().any(|v| !v.is_finite()) {
                return Err(ConvertError::runtime(format!(
                    "output {} contains non-finite values",
                    spec.name
                )));
            }
        }
    }
    Ok(())
}
