//! Checkpoint weights held as float32 candle tensors.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use candle_core::{Device, Tensor};
use safetensors::{Dtype, SafeTensors};
use serde::Deserialize;
use tracing::debug;

use crate::error::{ConvertError, Result};

pub const SINGLE_FILE: &str = "model.safetensors";
pub const INDEX_FILE: &str = "model.safetensors.index.json";

/// `model.safetensors.index.json`
#[derive(Debug, Deserialize)]
pub struct ShardIndex {
    pub weight_map: BTreeMap<String, String>,
}

impl ShardIndex {
    /// Shard file names in stable order.
    pub fn shard_files(&self) -> Vec<String> {
        self.weight_map
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Named float32 weights of one checkpoint.
#[derive(Debug, Default, Clone)]
pub struct WeightStore {
    tensors: HashMap<String, Tensor>,
}

impl WeightStore {
    /// Load `model.safetensors`, or every shard listed in the index file.
    pub fn load_dir(dir: &Path, source_id: &str) -> Result<Self> {
        let single = dir.join(SINGLE_FILE);
        if single.is_file() {
            let mut store = Self::default();
            store.load_file(&single, source_id)?;
            return Ok(store);
        }

        let index_path = dir.join(INDEX_FILE);
        if index_path.is_file() {
            let index = read_index(&index_path, source_id)?;
            let mut store = Self::default();
            for shard in index.shard_files() {
                store.load_file(&dir.join(&shard), source_id)?;
            }
            return Ok(store);
        }

        Err(ConvertError::SourceResolution {
            source_id: source_id.to_string(),
            message: format!("no safetensors weights in {}", dir.display()),
        })
    }

    fn load_file(&mut self, path: &Path, source_id: &str) -> Result<()> {
        let bytes = std::fs::read(path).map_err(|e| ConvertError::SourceResolution {
            source_id: source_id.to_string(),
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        let before = self.tensors.len();
        self.extend_from_bytes(&bytes, source_id)?;
        debug!(
            "Loaded {} tensors from {}",
            self.tensors.len() - before,
            path.display()
        );
        Ok(())
    }

    /// Parse a safetensors buffer. Floating tensors are widened to float32;
    /// integer buffers (such as cached position ids) are skipped.
    pub fn extend_from_bytes(&mut self, bytes: &[u8], source_id: &str) -> Result<()> {
        let invalid = |message: String| ConvertError::SourceResolution {
            source_id: source_id.to_string(),
            message,
        };
        let file = SafeTensors::deserialize(bytes)
            .map_err(|e| invalid(format!("invalid safetensors: {e}")))?;

        for (name, view) in file.tensors() {
            let data = view.data();
            let values: Vec<f32> = match view.dtype() {
                Dtype::F32 => data
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
                Dtype::F16 => data
                    .chunks_exact(2)
                    .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
                    .collect(),
                Dtype::BF16 => data
                    .chunks_exact(2)
                    .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
                    .collect(),
                other => {
                    debug!("Skipping non-float tensor {} ({:?})", name, other);
                    continue;
                }
            };
            let tensor = Tensor::from_vec(values, view.shape(), &Device::Cpu)
                .map_err(|e| invalid(format!("tensor {name}: {e}")))?;
            self.tensors.insert(name, tensor);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Look a weight up, failing the trace when it is absent.
    pub fn require(&self, name: &str) -> Result<&Tensor> {
        self.get(name)
            .ok_or_else(|| ConvertError::tracing(format!("missing weight {name}")))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

pub fn read_index(path: &Path, source_id: &str) -> Result<ShardIndex> {
    let text = std::fs::read_to_string(path).map_err(|e| ConvertError::SourceResolution {
        source_id: source_id.to_string(),
        message: format!("cannot read {}: {e}", path.display()),
    })?;
    serde_json::from_str(&text).map_err(|e| ConvertError::SourceResolution {
        source_id: source_id.to_string(),
        message: format!("invalid shard index: {e}"),
    })
}
