//! `weight.bin` codec.
//!
//! Weights are stored as safetensors. Float32 and float16 tensors keep their
//! names; a linear-quantized tensor `w` is split into `w` (packed `U8`
//! codes), `w#scale` and `w#offset` (float32 per row), and its bit width and
//! logical shape are recorded in the file metadata under `w`.

use std::collections::{BTreeMap, HashMap};

use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};

use crate::error::{ConvertError, Result};
use crate::lower::StoredTensor;
use crate::quantize::LinearQuantized;

const SCALE_SUFFIX: &str = "#scale";
const OFFSET_SUFFIX: &str = "#offset";
const FORMAT_KEY: &str = "format";
const FORMAT_VALUE: &str = "modelpack";

#[derive(Debug, Serialize, Deserialize)]
struct LinearLayout {
    bits: u32,
    shape: Vec<usize>,
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn read_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Serialize stored weights to a safetensors buffer.
pub fn encode(weights: &BTreeMap<String, StoredTensor>) -> Result<Vec<u8>> {
    let mut buffers: Vec<(String, Dtype, Vec<usize>, Vec<u8>)> = Vec::new();
    let mut metadata = HashMap::new();
    metadata.insert(FORMAT_KEY.to_string(), FORMAT_VALUE.to_string());

    for (name, stored) in weights {
        match stored {
            StoredTensor::Float32 { shape, data } => {
                buffers.push((name.clone(), Dtype::F32, shape.clone(), f32_bytes(data)));
            }
            StoredTensor::Float16 { shape, data } => {
                let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect();
                buffers.push((name.clone(), Dtype::F16, shape.clone(), bytes));
            }
            StoredTensor::Linear(q) => {
                let rows = q.scale.len();
                buffers.push((name.clone(), Dtype::U8, vec![q.packed.len()], q.packed.clone()));
                buffers.push((
                    format!("{name}{SCALE_SUFFIX}"),
                    Dtype::F32,
                    vec![rows],
                    f32_bytes(&q.scale),
                ));
                buffers.push((
                    format!("{name}{OFFSET_SUFFIX}"),
                    Dtype::F32,
                    vec![rows],
                    f32_bytes(&q.offset),
                ));
                let layout = LinearLayout {
                    bits: q.bits,
                    shape: q.shape.clone(),
                };
                metadata.insert(name.clone(), serde_json::to_string(&layout)?);
            }
        }
    }

    let views = buffers
        .iter()
        .map(|(name, dtype, shape, bytes)| {
            TensorView::new(*dtype, shape.clone(), bytes)
                .map(|view| (name.clone(), view))
                .map_err(|e| encode_error(name, e))
        })
        .collect::<Result<Vec<_>>>()?;
    safetensors::serialize(views, &Some(metadata)).map_err(|e| encode_error("weights", e))
}

fn encode_error(name: &str, e: safetensors::SafeTensorError) -> ConvertError {
    ConvertError::Persistence {
        path: name.into(),
        message: format!("cannot encode tensor: {e}"),
        source: None,
    }
}

/// Parse a buffer produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<BTreeMap<String, StoredTensor>> {
    let invalid = |message: String| ConvertError::runtime(format!("invalid weight file: {message}"));

    let (_, header) =
        SafeTensors::read_metadata(bytes).map_err(|e| invalid(e.to_string()))?;
    let metadata = header.metadata().clone().unwrap_or_default();
    if metadata.get(FORMAT_KEY).map(String::as_str) != Some(FORMAT_VALUE) {
        return Err(invalid("missing format marker".to_string()));
    }
    let file = SafeTensors::deserialize(bytes).map_err(|e| invalid(e.to_string()))?;

    let mut weights = BTreeMap::new();
    for (name, view) in file.tensors() {
        if name.ends_with(SCALE_SUFFIX) || name.ends_with(OFFSET_SUFFIX) {
            continue;
        }
        let stored = match view.dtype() {
            Dtype::F32 => StoredTensor::Float32 {
                shape: view.shape().to_vec(),
                data: read_f32(view.data()),
            },
            Dtype::F16 => StoredTensor::Float16 {
                shape: view.shape().to_vec(),
                data: view
                    .data()
                    .chunks_exact(2)
                    .map(|b| half::f16::from_le_bytes([b[0], b[1]]))
                    .collect(),
            },
            Dtype::U8 => {
                let layout: LinearLayout = metadata
                    .get(&name)
                    .ok_or_else(|| invalid(format!("no layout for quantized tensor {name}")))
                    .and_then(|raw| {
                        serde_json::from_str(raw).map_err(|e| invalid(format!("{name}: {e}")))
                    })?;
                let side = |suffix: &str| {
                    file.tensor(&format!("{name}{suffix}"))
                        .map(|t| read_f32(t.data()))
                        .map_err(|e| invalid(format!("{name}{suffix}: {e}")))
                };
                StoredTensor::Linear(LinearQuantized {
                    bits: layout.bits,
                    shape: layout.shape,
                    scale: side(SCALE_SUFFIX)?,
                    offset: side(OFFSET_SUFFIX)?,
                    packed: view.data().to_vec(),
                })
            }
            other => return Err(invalid(format!("unexpected dtype {other:?} for {name}"))),
        };
        weights.insert(name, stored);
    }
    Ok(weights)
}
