//! In-memory form of a deployable package.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::{Op, TensorSpec};
use crate::quantize::LinearQuantized;
use crate::registry::ModelKind;

/// Version of the manifest/program layout.
pub const FORMAT_VERSION: u32 = 1;

/// Hardware the runtime may schedule the program on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeUnits {
    All,
    CpuOnly,
}

/// Maps the argmax of the scores output to label names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierHead {
    /// Output the head reads.
    pub output: String,
    pub labels: Vec<String>,
    /// One label per sequence position instead of one per sequence.
    pub per_position: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationMode {
    Linear,
    Float16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationInfo {
    pub bits: u32,
    pub mode: QuantizationMode,
    /// Number of weights stored compressed; the rest stay float32.
    pub compressed_weights: usize,
}

/// How the bundled tokenizer output must be shaped for this program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preprocessing {
    pub max_length: usize,
    pub pad_token_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub model_type: String,
    pub kind: ModelKind,
    pub converter: String,
    pub created_at: DateTime<Utc>,
}

/// One data file of the package and its digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the package root, `/`-separated.
    pub path: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// `Manifest.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub name: String,
    pub deployment_target: u32,
    pub compute_units: ComputeUnits,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier: Option<ClassifierHead>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<QuantizationInfo>,
    pub preprocessing: Preprocessing,
    pub provenance: Provenance,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

/// One operation with string-named operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramNode {
    #[serde(flatten)]
    pub op: Op,
    pub inputs: Vec<String>,
    pub output: String,
}

/// `Data/model.program.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub spec_version: u32,
    pub inputs: Vec<TensorSpec>,
    /// Logical (float32) type of every weight the nodes reference.
    pub weights: Vec<TensorSpec>,
    pub nodes: Vec<ProgramNode>,
    pub outputs: Vec<TensorSpec>,
}

/// A weight as stored in the package.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredTensor {
    Float32 { shape: Vec<usize>, data: Vec<f32> },
    Float16 { shape: Vec<usize>, data: Vec<half::f16> },
    Linear(LinearQuantized),
}

impl StoredTensor {
    pub fn shape(&self) -> &[usize] {
        match self {
            StoredTensor::Float32 { shape, .. } | StoredTensor::Float16 { shape, .. } => shape,
            StoredTensor::Linear(q) => &q.shape,
        }
    }

    /// Widen back to float32 values in row-major order.
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            StoredTensor::Float32 { data, .. } => data.clone(),
            StoredTensor::Float16 { data, .. } => data.iter().map(|v| v.to_f32()).collect(),
            StoredTensor::Linear(q) => q.dequantize(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        !matches!(self, StoredTensor::Float32 { .. })
    }
}

/// Everything the writer persists for one entry.
#[derive(Debug, Clone)]
pub struct LoweredArtifact {
    pub manifest: Manifest,
    pub program: Program,
    pub weights: BTreeMap<String, StoredTensor>,
    pub tokenizer_json: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_node_serializes_flat() {
        let node = ProgramNode {
            op: Op::Softmax,
            inputs: vec!["var_3".into()],
            output: "var_4".into(),
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["op"], "softmax");
        assert_eq!(json["inputs"][0], "var_3");

        let node = ProgramNode {
            op: Op::Transpose { perm: vec![0, 2, 1, 3] },
            inputs: vec!["var_1".into()],
            output: "var_2".into(),
        };
        let back: ProgramNode =
            serde_json::from_str(&serde_json::to_string(&node).unwrap()).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_stored_tensor_widening() {
        let t = StoredTensor::Float16 {
            shape: vec![2],
            data: vec![half::f16::from_f32(0.5), half::f16::from_f32(-1.0)],
        };
        assert_eq!(t.to_f32(), vec![0.5, -1.0]);
        assert!(t.is_compressed());
        assert_eq!(t.shape(), &[2]);
    }
}
