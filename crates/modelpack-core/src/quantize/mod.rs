//! Post-training weight compression.
//!
//! Widths 1 to 8 use per-row affine linear quantization
//! (`w = q * scale + offset`) with codes bit-packed LSB first; 16 bits stores
//! float16. Only matrices (rank >= 2) are compressed, so biases and norm
//! parameters keep full precision.

use tracing::{debug, info};

use crate::error::{ConvertError, Result};
use crate::lower::{LoweredArtifact, QuantizationInfo, QuantizationMode, StoredTensor};

/// Linear-quantized matrix with one scale/offset pair per leading row.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearQuantized {
    pub bits: u32,
    pub shape: Vec<usize>,
    pub scale: Vec<f32>,
    pub offset: Vec<f32>,
    pub packed: Vec<u8>,
}

impl LinearQuantized {
    /// Quantize row-major `data` of the given shape. `bits` must be in `1..=8`.
    pub fn quantize(shape: &[usize], data: &[f32], bits: u32) -> Self {
        let rows = shape.first().copied().unwrap_or(1).max(1);
        let row_len = data.len() / rows;
        let levels = ((1u32 << bits) - 1) as f32;

        let mut scale = Vec::with_capacity(rows);
        let mut offset = Vec::with_capacity(rows);
        let mut codes = Vec::with_capacity(data.len());

        for row in data.chunks(row_len.max(1)) {
            let min = row.iter().copied().fold(f32::INFINITY, f32::min);
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let step = if max > min { (max - min) / levels } else { 0.0 };
            scale.push(step);
            offset.push(min);
            for &w in row {
                let q = if step > 0.0 {
                    ((w - min) / step).round().clamp(0.0, levels) as u32
                } else {
                    0
                };
                codes.push(q);
            }
        }

        Self {
            bits,
            shape: shape.to_vec(),
            scale,
            offset,
            packed: pack_bits(&codes, bits),
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn dequantize(&self) -> Vec<f32> {
        let numel = self.numel();
        let rows = self.scale.len().max(1);
        let row_len = (numel / rows).max(1);
        unpack_bits(&self.packed, self.bits, numel)
            .into_iter()
            .enumerate()
            .map(|(i, q)| {
                let row = (i / row_len).min(rows - 1);
                q as f32 * self.scale[row] + self.offset[row]
            })
            .collect()
    }
}

/// Pack `bits`-wide codes into bytes, least significant bit first.
pub fn pack_bits(codes: &[u32], bits: u32) -> Vec<u8> {
    let total_bits = codes.len() * bits as usize;
    let mut out = vec![0u8; total_bits.div_ceil(8)];
    for (i, &code) in codes.iter().enumerate() {
        let base = i * bits as usize;
        for b in 0..bits as usize {
            if (code >> b) & 1 == 1 {
                let pos = base + b;
                out[pos / 8] |= 1 << (pos % 8);
            }
        }
    }
    out
}

pub fn unpack_bits(packed: &[u8], bits: u32, count: usize) -> Vec<u32> {
    (0..count)
        .map(|i| {
            let base = i * bits as usize;
            (0..bits as usize).fold(0u32, |acc, b| {
                let pos = base + b;
                let bit = packed.get(pos / 8).map_or(0, |byte| (byte >> (pos % 8)) & 1);
                acc | (u32::from(bit) << b)
            })
        })
        .collect()
}

/// Applies the configured compression to a lowered artifact.
pub struct WeightCompressor;

impl WeightCompressor {
    /// Validate a bit width without touching any artifact.
    pub fn mode_for(bits: u32) -> Result<QuantizationMode> {
        match bits {
            1..=8 => Ok(QuantizationMode::Linear),
            16 => Ok(QuantizationMode::Float16),
            other => Err(ConvertError::Quantization {
                bits: other,
                message: "supported widths are 1 to 8 (linear) and 16 (float16)".to_string(),
            }),
        }
    }

    /// Compress every matrix in place. `None` leaves the artifact unchanged.
    pub fn compress(artifact: &mut LoweredArtifact, bits: Option<u32>) -> Result<()> {
        let Some(bits) = bits else {
            return Ok(());
        };
        let mode = Self::mode_for(bits)?;
        if artifact.manifest.quantization.is_some() {
            return Err(ConvertError::Quantization {
                bits,
                message: "artifact is already compressed".to_string(),
            });
        }

        let mut compressed = 0;
        for (name, stored) in artifact.weights.iter_mut() {
            let StoredTensor::Float32 { shape, data } = stored else {
                continue;
            };
            if shape.len() < 2 {
                continue;
            }
            *stored = match mode {
                QuantizationMode::Linear => {
                    StoredTensor::Linear(LinearQuantized::quantize(shape, data, bits))
                }
                QuantizationMode::Float16 => StoredTensor::Float16 {
                    shape: shape.clone(),
                    data: data.iter().map(|v| half::f16::from_f32(*v)).collect(),
                },
            };
            debug!("Compressed {} to {} bits", name, bits);
            compressed += 1;
        }

        artifact.manifest.quantization = Some(QuantizationInfo {
            bits,
            mode,
            compressed_weights: compressed,
        });
        info!(
            "Compressed {} of {} weights to {} bits",
            compressed,
            artifact.weights.len(),
            bits
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_lsb_first() {
        assert_eq!(pack_bits(&[1, 0, 1, 1], 1), vec![0b0000_1101]);
        assert_eq!(pack_bits(&[0x3, 0x1], 4), vec![0x13]);
        let codes = vec![5, 0, 7, 2, 6];
        let packed = pack_bits(&codes, 3);
        assert_eq!(packed.len(), 2);
        assert_eq!(unpack_bits(&packed, 3, codes.len()), codes);
    }

    #[test]
    fn test_linear_error_is_bounded_per_row() {
        let data: Vec<f32> = (0..24).map(|i| ((i * 7) % 11) as f32 * 0.13 - 0.6).collect();
        for bits in [2, 4, 8] {
            let q = LinearQuantized::quantize(&[3, 8], &data, bits);
            assert_eq!(q.scale.len(), 3);
            let restored = q.dequantize();
            for (i, (a, b)) in data.iter().zip(&restored).enumerate() {
                let half_step = q.scale[i / 8] / 2.0 + 1e-6;
                assert!((a - b).abs() <= half_step, "bits {bits}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_constant_row_round_trips_exactly() {
        let q = LinearQuantized::quantize(&[2, 2], &[0.25, 0.25, -1.0, 1.0], 1);
        assert_eq!(q.dequantize(), vec![0.25, 0.25, -1.0, 1.0]);
    }

    #[test]
    fn test_mode_for_widths() {
        assert_eq!(WeightCompressor::mode_for(8).unwrap(), QuantizationMode::Linear);
        assert_eq!(WeightCompressor::mode_for(1).unwrap(), QuantizationMode::Linear);
        assert_eq!(WeightCompressor::mode_for(16).unwrap(), QuantizationMode::Float16);
        for bad in [0, 9, 12, 32] {
            assert!(matches!(
                WeightCompressor::mode_for(bad),
                Err(ConvertError::Quantization { .. })
            ));
        }
    }
}
