//! CPU runtime for written packages.
//!
//! Loads a package the way a device would: the manifest is the entry point,
//! every data file is checked against its recorded digest, and the program
//! is type-checked before anything runs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{DType as CandleDType, Device, Tensor};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{PathsConfig, PipelineConfig};
use crate::error::{ConvertError, Result};
use crate::graph::{eval, int_tensor, DType, TensorSpec, TensorType};
use crate::lower::{Manifest, Program, FORMAT_VERSION};
use crate::materialize::Preprocessor;
use crate::writer::{sha256_file, weights};

/// One named output, flattened row-major.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl OutputTensor {
    /// Index of the largest score in every row of the last axis.
    pub fn argmax_rows(&self) -> Vec<usize> {
        let width = self.shape.last().copied().unwrap_or(1).max(1);
        self.data
            .chunks(width)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 {
                            (i, v)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub outputs: BTreeMap<String, OutputTensor>,
    /// Present when the package has a classifier head: one label, or one
    /// per position for token classification.
    pub labels: Option<Vec<String>>,
}

/// A loaded, verified package.
pub struct PackageRuntime {
    path: PathBuf,
    manifest: Manifest,
    program: Program,
    weights: HashMap<String, Tensor>,
    preprocessor: Preprocessor,
}

impl std::fmt::Debug for PackageRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageRuntime")
            .field("path", &self.path)
            .field("name", &self.manifest.name)
            .field("nodes", &self.program.nodes.len())
            .finish()
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| ConvertError::runtime(format!("cannot read {}: {e}", path.display())))
}

impl PackageRuntime {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let manifest_bytes = read_file(&path.join(PathsConfig::MANIFEST_FILE))?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| ConvertError::runtime(format!("invalid manifest: {e}")))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(ConvertError::runtime(format!(
                "unsupported package format version {}",
                manifest.format_version
            )));
        }

        for required in [
            PathsConfig::PROGRAM_FILE,
            PathsConfig::WEIGHTS_FILE,
            PathsConfig::TOKENIZER_FILE,
        ] {
            if !manifest.files.iter().any(|f| f.path == required) {
                return Err(ConvertError::runtime(format!(
                    "manifest does not list {required}"
                )));
            }
        }
        for entry in &manifest.files {
            let file = path.join(&entry.path);
            let digest = sha256_file(&file)
                .map_err(|e| ConvertError::runtime(format!("cannot hash {}: {e}", entry.path)))?;
            if digest != entry.sha256 {
                return Err(ConvertError::runtime(format!(
                    "digest mismatch for {}",
                    entry.path
                )));
            }
        }

        let program: Program =
            serde_json::from_slice(&read_file(&path.join(PathsConfig::PROGRAM_FILE))?)
                .map_err(|e| ConvertError::runtime(format!("invalid program: {e}")))?;
        let stored = weights::decode(&read_file(&path.join(PathsConfig::WEIGHTS_FILE))?)?;

        let mut tensors = HashMap::with_capacity(stored.len());
        for (name, weight) in stored {
            let tensor = Tensor::from_vec(weight.to_f32(), weight.shape(), &Device::Cpu)?;
            tensors.insert(name, tensor);
        }

        let tokenizer = String::from_utf8(read_file(&path.join(PathsConfig::TOKENIZER_FILE))?)
            .map_err(|e| ConvertError::runtime(format!("tokenizer is not UTF-8: {e}")))?;
        let preprocessor = Preprocessor::from_json_str(&tokenizer, &manifest.name)
            .map_err(|e| ConvertError::runtime(e.to_string()))?;

        let runtime = Self {
            path: path.to_path_buf(),
            manifest,
            program,
            weights: tensors,
            preprocessor,
        };
        runtime.type_check()?;
        info!(
            "Loaded package {} ({} nodes)",
            runtime.manifest.name,
            runtime.program.nodes.len()
        );
        Ok(runtime)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-derive every value type from the declared inputs and weights.
    fn type_check(&self) -> Result<()> {
        if self.program.inputs != self.manifest.inputs || self.program.outputs != self.manifest.outputs
        {
            return Err(ConvertError::runtime(
                "program and manifest disagree on the input/output contract",
            ));
        }

        let mut types: HashMap<&str, TensorType> = HashMap::new();
        for spec in &self.program.inputs {
            types.insert(&spec.name, spec.tensor_type());
        }
        for spec in &self.program.weights {
            let tensor = self
                .weights
                .get(&spec.name)
                .ok_or_else(|| ConvertError::runtime(format!("weight {} not stored", spec.name)))?;
            if tensor.dims() != spec.shape.as_slice() || spec.dtype != DType::Float32 {
                return Err(ConvertError::runtime(format!(
                    "weight {} does not match its declared type",
                    spec.name
                )));
            }
            types.insert(&spec.name, spec.tensor_type());
        }

        for node in &self.program.nodes {
            let inputs = node
                .inputs
                .iter()
                .map(|name| {
                    types.get(name.as_str()).ok_or_else(|| {
                        ConvertError::runtime(format!("{} reads undefined value {name}", node.op.name()))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let ty = node
                .op
                .infer(&inputs)
                .map_err(|e| ConvertError::runtime(format!("{}: {e}", node.op.name())))?;
            types.insert(&node.output, ty);
        }

        for spec in &self.program.outputs {
            if types.get(spec.name.as_str()) != Some(&spec.tensor_type()) {
                return Err(ConvertError::runtime(format!(
                    "output {} does not match its declared type",
                    spec.name
                )));
            }
        }
        debug!("Program type-checks ({} values)", types.len());
        Ok(())
    }

    /// Run the program on token ids and an attention mask of shape `shape`.
    pub fn predict(&self, input_ids: &[i32], attention_mask: &[i32], shape: &[usize]) -> Result<Prediction> {
        let mut env: HashMap<&str, Tensor> = HashMap::new();
        for spec in &self.program.inputs {
            let data = match spec.name.as_str() {
                PipelineConfig::INPUT_IDS => input_ids,
                PipelineConfig::ATTENTION_MASK => attention_mask,
                other => {
                    return Err(ConvertError::runtime(format!("unknown program input {other}")))
                }
            };
            check_input(spec, data, shape)?;
            env.insert(&spec.name, int_tensor(data, shape)?);
        }

        for node in &self.program.nodes {
            let args = node
                .inputs
                .iter()
                .map(|name| {
                    env.get(name.as_str())
                        .or_else(|| self.weights.get(name))
                        .ok_or_else(|| ConvertError::runtime(format!("undefined value {name}")))
                })
                .collect::<Result<Vec<_>>>()?;
            let value = eval(&node.op, &args)?;
            env.insert(&node.output, value);
        }

        let mut outputs = BTreeMap::new();
        for spec in &self.program.outputs {
            let tensor = env
                .get(spec.name.as_str())
                .ok_or_else(|| ConvertError::runtime(format!("output {} not computed", spec.name)))?;
            let data = tensor
                .to_dtype(CandleDType::F32)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            outputs.insert(
                spec.name.clone(),
                OutputTensor {
                    shape: tensor.dims().to_vec(),
                    data,
                },
            );
        }

        let labels = match &self.manifest.classifier {
            Some(head) => {
                let scores = outputs.get(&head.output).ok_or_else(|| {
                    ConvertError::runtime(format!("classifier output {} missing", head.output))
                })?;
                let picked = scores
                    .argmax_rows()
                    .into_iter()
                    .map(|i| {
                        head.labels
                            .get(i)
                            .cloned()
                            .ok_or_else(|| ConvertError::runtime(format!("no label for class {i}")))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Some(picked)
            }
            None => None,
        };

        Ok(Prediction { outputs, labels })
    }

    /// Tokenize with the bundled tokenizer, then [`predict`](Self::predict).
    pub fn predict_text(&self, text: &str) -> Result<Prediction> {
        let pre = &self.manifest.preprocessing;
        let (ids, mask) = self
            .preprocessor
            .encode_fixed(text, pre.max_length, pre.pad_token_id)
            .map_err(|e| ConvertError::runtime(e.to_string()))?;
        self.predict(&ids, &mask, &[1, pre.max_length])
    }
}

fn check_input(spec: &TensorSpec, data: &[i32], shape: &[usize]) -> Result<()> {
    if shape != spec.shape.as_slice() {
        return Err(ConvertError::runtime(format!(
            "input {} expects shape {:?}, got {:?}",
            spec.name, spec.shape, shape
        )));
    }
    let expected: usize = shape.iter().product();
    if data.len() != expected {
        return Err(ConvertError::runtime(format!(
            "input {} has {} values, shape {:?} needs {expected}",
            spec.name,
            data.len(),
            shape
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argmax_rows() {
        let scores = OutputTensor {
            shape: vec![1, 3, 2],
            data: vec![0.1, 0.9, 2.0, -1.0, 0.0, 0.0],
        };
        assert_eq!(scores.argmax_rows(), vec![1, 0, 0]);
    }

    #[test]
    fn test_check_input_rejects_other_shapes() {
        let spec = TensorSpec {
            name: "input_ids".into(),
            dtype: DType::Int32,
            shape: vec![1, 4],
        };
        assert!(check_input(&spec, &[0; 4], &[1, 4]).is_ok());
        assert!(check_input(&spec, &[0; 8], &[1, 8]).is_err());
        assert!(check_input(&spec, &[0; 3], &[1, 4]).is_err());
    }

    #[test]
    fn test_missing_package_is_runtime_error() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            PackageRuntime::load(temp.path()),
            Err(ConvertError::Runtime { .. })
        ));
    }
}
