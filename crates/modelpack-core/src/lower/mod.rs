//! Format lowering: frozen graph to package program, manifest and weights.

mod package;

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::{ConvertError, Result};
use crate::graph::{
    DType, FrozenGraph, Op, TensorSpec, TensorType, ValueId, ValueOrigin, LATEST_SPEC_VERSION,
};
use crate::registry::{ConversionSpec, ModelKind};

pub use package::{
    ClassifierHead, ComputeUnits, FileEntry, LoweredArtifact, Manifest, Preprocessing, Program,
    ProgramNode, Provenance, QuantizationInfo, QuantizationMode, StoredTensor, FORMAT_VERSION,
};

/// Operator coverage of one runtime spec version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetProfile {
    pub spec_version: u32,
}

impl TargetProfile {
    pub fn latest() -> Self {
        Self {
            spec_version: LATEST_SPEC_VERSION,
        }
    }

    pub fn new(spec_version: u32) -> Result<Self> {
        if spec_version == 0 || spec_version > LATEST_SPEC_VERSION {
            return Err(ConvertError::Lowering {
                operator: "deployment_target".to_string(),
                shape: "[]".to_string(),
                dtype: "-".to_string(),
                message: format!(
                    "spec version {spec_version} is not supported (latest is {LATEST_SPEC_VERSION})"
                ),
            });
        }
        Ok(Self { spec_version })
    }

    pub fn supports(&self, op: &Op) -> bool {
        op.min_spec_version() <= self.spec_version
    }
}

/// Per-entry information the lowerer records in the manifest.
#[derive(Debug, Clone)]
pub struct LoweringContext<'a> {
    pub name: &'a str,
    pub spec: &'a ConversionSpec,
    pub model_type: &'a str,
    pub pad_token_id: u32,
    pub tokenizer_json: &'a str,
}

/// Lowers frozen graphs into [`LoweredArtifact`]s.
pub struct FormatLowerer;

impl FormatLowerer {
    pub fn lower(graph: &FrozenGraph, ctx: &LoweringContext<'_>) -> Result<LoweredArtifact> {
        let spec = ctx.spec;
        let target = match spec.deployment_target {
            Some(version) => TargetProfile::new(version)?,
            None => TargetProfile::latest(),
        };

        let declared = TensorType::int([1, spec.max_length]);
        let inputs = Self::bind_inputs(graph, &declared)?;
        let names = Self::name_values(graph)?;
        let nodes = Self::lower_nodes(graph, &names, target)?;

        let outputs: Vec<TensorSpec> = graph
            .outputs()
            .iter()
            .map(|(name, id)| TensorSpec::new(name.clone(), &graph.value(*id).ty))
            .collect();
        let classifier = Self::classifier_head(graph, spec)?;

        let mut weight_specs = Vec::with_capacity(graph.weights().len());
        let mut weights = BTreeMap::new();
        for (name, tensor) in graph.weights() {
            let shape = tensor.dims().to_vec();
            let data = tensor
                .flatten_all()
                .and_then(|t| t.to_vec1::<f32>())
                .map_err(|e| ConvertError::Lowering {
                    operator: "weight".to_string(),
                    shape: crate::graph::format_shape(&shape),
                    dtype: DType::Float32.to_string(),
                    message: format!("{name}: {e}"),
                })?;
            weight_specs.push(TensorSpec::new(name.clone(), &TensorType::float(shape.clone())));
            weights.insert(name.clone(), StoredTensor::Float32 { shape, data });
        }

        let program = Program {
            spec_version: target.spec_version,
            inputs: inputs.clone(),
            weights: weight_specs,
            nodes,
            outputs: outputs.clone(),
        };

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            name: ctx.name.to_string(),
            deployment_target: target.spec_version,
            compute_units: ComputeUnits::All,
            inputs,
            outputs,
            classifier,
            quantization: None,
            preprocessing: Preprocessing {
                max_length: spec.max_length,
                pad_token_id: ctx.pad_token_id,
            },
            provenance: Provenance {
                source: spec.source.clone(),
                model_type: ctx.model_type.to_string(),
                kind: spec.kind,
                converter: concat!("modelpack ", env!("CARGO_PKG_VERSION")).to_string(),
                created_at: Utc::now(),
            },
            files: Vec::new(),
        };

        info!(
            "Lowered {} for spec version {} ({} nodes, {} weights)",
            ctx.name,
            target.spec_version,
            program.nodes.len(),
            weights.len()
        );
        Ok(LoweredArtifact {
            manifest,
            program,
            weights,
            tokenizer_json: ctx.tokenizer_json.to_string(),
        })
    }

    /// The graph inputs must be exactly `input_ids` and `attention_mask` of
    /// the declared type.
    fn bind_inputs(graph: &FrozenGraph, declared: &TensorType) -> Result<Vec<TensorSpec>> {
        let expected = [PipelineConfig::INPUT_IDS, PipelineConfig::ATTENTION_MASK];

        for (name, id) in graph.inputs() {
            let ty = &graph.value(*id).ty;
            if !expected.contains(&name.as_str()) {
                return Err(contract_error(name, ty, "unexpected graph input".to_string()));
            }
            if ty != declared {
                return Err(contract_error(
                    name,
                    ty,
                    format!("input does not match the declared contract {declared}"),
                ));
            }
        }

        expected
            .iter()
            .map(|name| match graph.input_type(name) {
                Some(_) => Ok(TensorSpec::new(*name, declared)),
                None => Err(contract_error(name, declared, "input missing from graph".to_string())),
            })
            .collect()
    }

    /// Inputs, weights and outputs keep their names; intermediates become `var_<n>`.
    fn name_values(graph: &FrozenGraph) -> Result<HashMap<ValueId, String>> {
        let mut names = HashMap::new();
        for (name, id) in graph.inputs() {
            names.insert(*id, name.clone());
        }
        for (name, id) in graph.outputs() {
            if let Some(existing) = names.insert(*id, name.clone()) {
                let ty = &graph.value(*id).ty;
                return Err(contract_error(
                    name,
                    ty,
                    format!("value already exported as {existing}"),
                ));
            }
        }

        let mut counter = 0usize;
        for node in graph.nodes() {
            for &input in &node.inputs {
                if let ValueOrigin::Weight(weight) = &graph.value(input).origin {
                    names.entry(input).or_insert_with(|| weight.clone());
                }
            }
            names.entry(node.output).or_insert_with(|| {
                let name = format!("var_{counter}");
                counter += 1;
                name
            });
        }
        Ok(names)
    }

    fn lower_nodes(
        graph: &FrozenGraph,
        names: &HashMap<ValueId, String>,
        target: TargetProfile,
    ) -> Result<Vec<ProgramNode>> {
        let mut nodes = Vec::with_capacity(graph.nodes().len());
        for node in graph.nodes() {
            let input_types: Vec<&TensorType> =
                node.inputs.iter().map(|id| &graph.value(*id).ty).collect();
            let subject = input_types
                .first()
                .copied()
                .unwrap_or(&graph.value(node.output).ty);
            let fail = |message: String| ConvertError::Lowering {
                operator: node.op.name().to_string(),
                shape: subject.shape_string(),
                dtype: subject.dtype.to_string(),
                message,
            };

            if !target.supports(&node.op) {
                return Err(fail(format!(
                    "requires spec version {}, deployment target is {}",
                    node.op.min_spec_version(),
                    target.spec_version
                )));
            }
            let inferred = node.op.infer(&input_types).map_err(fail)?;
            if inferred != graph.value(node.output).ty {
                return Err(fail(format!(
                    "traced type {} disagrees with inferred type {inferred}",
                    graph.value(node.output).ty
                )));
            }

            let lookup = |id: &ValueId| {
                names
                    .get(id)
                    .cloned()
                    .ok_or_else(|| fail(format!("operand {} has no name", id.0)))
            };
            nodes.push(ProgramNode {
                op: node.op.clone(),
                inputs: node.inputs.iter().map(lookup).collect::<Result<Vec<_>>>()?,
                output: lookup(&node.output)?,
            });
        }
        debug!("Lowered {} nodes", nodes.len());
        Ok(nodes)
    }

    /// Attach label names to the single scores output.
    fn classifier_head(graph: &FrozenGraph, spec: &ConversionSpec) -> Result<Option<ClassifierHead>> {
        let Some(labels) = spec.classifier_labels() else {
            return Ok(None);
        };
        let [(output, id)] = graph.outputs() else {
            return Err(ConvertError::Lowering {
                operator: "classifier".to_string(),
                shape: "-".to_string(),
                dtype: "-".to_string(),
                message: format!(
                    "a classifier head needs exactly one output, graph has {}",
                    graph.outputs().len()
                ),
            });
        };
        let ty = &graph.value(*id).ty;
        if ty.dtype != DType::Float32 || ty.last_dim() != labels.len() {
            return Err(ConvertError::Lowering {
                operator: "classifier".to_string(),
                shape: ty.shape_string(),
                dtype: ty.dtype.to_string(),
                message: format!(
                    "{} labels configured but the scores have {} classes",
                    labels.len(),
                    ty.last_dim()
                ),
            });
        }
        Ok(Some(ClassifierHead {
            output: output.clone(),
            labels: labels.to_vec(),
            per_position: spec.kind == ModelKind::TokenClassification,
        }))
    }
}

fn contract_error(name: &str, ty: &TensorType, message: String) -> ConvertError {
    ConvertError::Lowering {
        operator: format!("input:{name}"),
        shape: ty.shape_string(),
        dtype: ty.dtype.to_string(),
        message,
    }
}
