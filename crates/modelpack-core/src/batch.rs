//! Batch orchestration over registry entries.
//!
//! A run moves `Idle -> Resolving -> Converting* -> Reported`. Each entry is
//! converted in isolation: its failure becomes its [`ConversionResult`] and
//! the run continues with the next name.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::RunOptions;
use crate::error::{FailureKind, Result};
use crate::materialize::ModelMaterializer;
use crate::pipeline::{EntryPipeline, Stage};
use crate::registry::Registry;
use crate::writer::{ArtifactWriter, OutputRoot, WrittenPackage};

/// Where a run currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Resolving { names: Vec<String> },
    Converting { entry: String, index: usize, total: usize },
    Reported,
}

/// Final state of one requested entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Converted {
        path: PathBuf,
        size_bytes: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quantized_bits: Option<u32>,
    },
    Failed {
        kind: FailureKind,
        reason: String,
        stage: Stage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback: Option<WrittenPackage>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub name: String,
    pub outcome: Outcome,
}

impl ConversionResult {
    pub fn is_converted(&self) -> bool {
        matches!(self.outcome, Outcome::Converted { .. })
    }
}

impl std::fmt::Display for ConversionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.outcome {
            Outcome::Converted {
                path, size_bytes, ..
            } => write!(f, "Converted({}, {})", path.display(), size_bytes),
            Outcome::Failed { reason, .. } => write!(f, "Failed({}, {})", self.name, reason),
        }
    }
}

/// Summary of one run, one result per requested name in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<ConversionResult>,
}

impl RunReport {
    pub fn converted(&self) -> usize {
        self.results.iter().filter(|r| r.is_converted()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.converted()
    }

    pub fn all_converted(&self) -> bool {
        self.failed() == 0
    }

    pub fn result(&self, name: &str) -> Option<&ConversionResult> {
        self.results.iter().find(|r| r.name == name)
    }
}

/// Runs requested registry entries through the pipeline, one at a time.
pub struct BatchOrchestrator {
    registry: Registry,
    materializer: ModelMaterializer,
    writer: ArtifactWriter,
    verify: bool,
    state: RunState,
}

impl BatchOrchestrator {
    /// Set up run resources. The output root is created here, before any
    /// entry is processed.
    pub fn new(registry: Registry, options: &RunOptions) -> Result<Self> {
        let root = OutputRoot::init(&options.output_dir)?;
        Ok(Self {
            registry,
            materializer: ModelMaterializer::new(options)?,
            writer: ArtifactWriter::new(root),
            verify: options.verify,
            state: RunState::Idle,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Convert `names` in order, or every registry entry when empty.
    pub async fn run(&mut self, names: &[String]) -> RunReport {
        let started_at = Utc::now();
        let names: Vec<String> = if names.is_empty() {
            self.registry.names().to_vec()
        } else {
            names.to_vec()
        };
        self.state = RunState::Resolving {
            names: names.clone(),
        };
        info!("Converting {} model(s)", names.len());

        let total = names.len();
        let mut results = Vec::with_capacity(total);
        for (index, name) in names.into_iter().enumerate() {
            self.state = RunState::Converting {
                entry: name.clone(),
                index,
                total,
            };
            let outcome = self.convert_one(&name).await;
            match &outcome {
                Outcome::Converted { path, size_bytes, .. } => {
                    info!("[{}] converted to {} ({} bytes)", name, path.display(), size_bytes)
                }
                Outcome::Failed { kind, reason, stage, .. } => {
                    error!("[{}] failed while {} ({}): {}", name, stage, kind, reason)
                }
            }
            results.push(ConversionResult { name, outcome });
        }

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            results,
        };
        self.state = RunState::Reported;
        info!(
            "Run finished: {} converted, {} failed",
            report.converted(),
            report.failed()
        );
        report
    }

    async fn convert_one(&self, name: &str) -> Outcome {
        let spec = match self.registry.spec(name) {
            Ok(spec) => spec,
            Err(e) => {
                warn!("[{}] {}", name, e);
                return Outcome::Failed {
                    kind: e.failure_kind(),
                    reason: e.to_string(),
                    stage: Stage::Resolving,
                    fallback: None,
                };
            }
        };

        let pipeline = EntryPipeline::new(&self.materializer, &self.writer, self.verify);
        match pipeline.convert(name, spec).await {
            Ok(converted) => Outcome::Converted {
                path: converted.package.path,
                size_bytes: converted.package.size_bytes,
                quantized_bits: converted.quantized_bits,
            },
            Err(failure) => Outcome::Failed {
                kind: failure.error.failure_kind(),
                reason: failure.error.to_string(),
                stage: failure.stage,
                fallback: failure.fallback,
            },
        }
    }
}
