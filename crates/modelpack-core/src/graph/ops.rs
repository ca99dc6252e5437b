//! Operator set and static type inference.
//!
//! The same inference runs in three places: while tracing (to record each
//! value's type), while lowering (to re-check the graph against the declared
//! contract and the deployment target) and when a package is loaded.

use serde::{Deserialize, Serialize};

use super::types::{format_shape, DType, TensorType};

/// Latest runtime spec version understood by the lowerer and the runtime.
pub const LATEST_SPEC_VERSION: u32 = 3;

/// A single graph operation. Inputs are positional; see each variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// `[table (V, H), indices int32 (...)] -> (..., H)`
    Gather,
    /// Elementwise with numpy-style broadcasting: `[a, b]`.
    Add,
    Sub,
    Mul,
    Div,
    /// `[a (..., m, k), b (..., k, n)] -> (..., m, n)`
    MatMul,
    /// `[x (..., in), weight (out, in), bias (out)] -> (..., out)`
    Linear,
    /// Normalizes over the last axis: `[x (..., h), gamma (h), beta (h)]`.
    LayerNorm { eps: f64 },
    /// Softmax over the last axis.
    Softmax,
    Gelu { approximate: bool },
    Tanh,
    Relu,
    Reshape { shape: Vec<usize> },
    Transpose { perm: Vec<usize> },
    Slice { axis: usize, start: usize, len: usize },
    /// Picks one index along `axis` and drops that axis.
    Select { axis: usize, index: usize },
    Cast { to: DType },
    /// `x * mul + add`
    Affine { mul: f64, add: f64 },
    /// Inclusive prefix sum along `axis`.
    CumSum { axis: usize },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Gather => "gather",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::MatMul => "matmul",
            Op::Linear => "linear",
            Op::LayerNorm { .. } => "layer_norm",
            Op::Softmax => "softmax",
            Op::Gelu { .. } => "gelu",
            Op::Tanh => "tanh",
            Op::Relu => "relu",
            Op::Reshape { .. } => "reshape",
            Op::Transpose { .. } => "transpose",
            Op::Slice { .. } => "slice",
            Op::Select { .. } => "select",
            Op::Cast { .. } => "cast",
            Op::Affine { .. } => "affine",
            Op::CumSum { .. } => "cumsum",
        }
    }

    /// First runtime spec version that implements this operator.
    pub fn min_spec_version(&self) -> u32 {
        match self {
            Op::LayerNorm { .. } | Op::Gelu { .. } => 2,
            Op::CumSum { .. } => 3,
            _ => 1,
        }
    }

    fn arity(&self) -> usize {
        match self {
            Op::Linear | Op::LayerNorm { .. } => 3,
            Op::Gather | Op::Add | Op::Sub | Op::Mul | Op::Div | Op::MatMul => 2,
            _ => 1,
        }
    }

    /// Infer the output type from the input types.
    ///
    /// The error string explains the first violated constraint.
    pub fn infer(&self, inputs: &[&TensorType]) -> Result<TensorType, String> {
        if inputs.len() != self.arity() {
            return Err(format!(
                "expected {} inputs, got {}",
                self.arity(),
                inputs.len()
            ));
        }

        match self {
            Op::Gather => {
                let (table, indices) = (inputs[0], inputs[1]);
                require_dtype(table, DType::Float32, "table")?;
                require_dtype(indices, DType::Int32, "indices")?;
                if table.rank() != 2 {
                    return Err(format!("table must be rank 2, got {}", table.shape_string()));
                }
                let mut shape = indices.shape.clone();
                shape.push(table.shape[1]);
                Ok(TensorType::float(shape))
            }
            Op::Add | Op::Sub | Op::Mul | Op::Div => {
                let (a, b) = (inputs[0], inputs[1]);
                require_dtype(a, DType::Float32, "lhs")?;
                require_dtype(b, DType::Float32, "rhs")?;
                let shape = broadcast_shapes(&a.shape, &b.shape).ok_or_else(|| {
                    format!(
                        "cannot broadcast {} with {}",
                        a.shape_string(),
                        b.shape_string()
                    )
                })?;
                Ok(TensorType::float(shape))
            }
            Op::MatMul => {
                let (a, b) = (inputs[0], inputs[1]);
                require_dtype(a, DType::Float32, "lhs")?;
                require_dtype(b, DType::Float32, "rhs")?;
                if a.rank() < 2 || a.rank() != b.rank() {
                    return Err(format!(
                        "matmul needs equal ranks >= 2, got {} and {}",
                        a.shape_string(),
                        b.shape_string()
                    ));
                }
                let r = a.rank();
                if a.shape[..r - 2] != b.shape[..r - 2] || a.shape[r - 1] != b.shape[r - 2] {
                    return Err(format!(
                        "incompatible matmul operands {} and {}",
                        a.shape_string(),
                        b.shape_string()
                    ));
                }
                let mut shape = a.shape[..r - 1].to_vec();
                shape.push(b.shape[r - 1]);
                Ok(TensorType::float(shape))
            }
            Op::Linear => {
                let (x, w, b) = (inputs[0], inputs[1], inputs[2]);
                require_dtype(x, DType::Float32, "input")?;
                require_dtype(w, DType::Float32, "weight")?;
                require_dtype(b, DType::Float32, "bias")?;
                if x.rank() == 0 || w.rank() != 2 || b.shape != [w.shape[0]] {
                    return Err(format!(
                        "linear shapes do not line up: x {}, weight {}, bias {}",
                        x.shape_string(),
                        w.shape_string(),
                        b.shape_string()
                    ));
                }
                if x.last_dim() != w.shape[1] {
                    return Err(format!(
                        "input features {} do not match weight {}",
                        x.last_dim(),
                        w.shape_string()
                    ));
                }
                let mut shape = x.shape[..x.rank() - 1].to_vec();
                shape.push(w.shape[0]);
                Ok(TensorType::float(shape))
            }
            Op::LayerNorm { .. } => {
                let (x, gamma, beta) = (inputs[0], inputs[1], inputs[2]);
                require_dtype(x, DType::Float32, "input")?;
                let h = x.last_dim();
                if gamma.shape != [h] || beta.shape != [h] {
                    return Err(format!(
                        "norm parameters {} / {} do not match hidden size {h}",
                        gamma.shape_string(),
                        beta.shape_string()
                    ));
                }
                Ok(x.clone())
            }
            Op::Softmax
            | Op::Gelu { .. }
            | Op::Tanh
            | Op::Relu
            | Op::Affine { .. } => {
                require_dtype(inputs[0], DType::Float32, "input")?;
                if inputs[0].rank() == 0 {
                    return Err("scalar input".into());
                }
                Ok(inputs[0].clone())
            }
            Op::CumSum { axis } => {
                let x = inputs[0];
                require_dtype(x, DType::Float32, "input")?;
                require_axis(x, *axis)?;
                Ok(x.clone())
            }
            Op::Reshape { shape } => {
                let x = inputs[0];
                let numel: usize = shape.iter().product();
                if numel != x.numel() {
                    return Err(format!(
                        "cannot reshape {} into {}",
                        x.shape_string(),
                        format_shape(shape)
                    ));
                }
                Ok(TensorType::new(x.dtype, shape.clone()))
            }
            Op::Transpose { perm } => {
                let x = inputs[0];
                let mut seen = vec![false; x.rank()];
                if perm.len() != x.rank() {
                    return Err(format!("permutation {perm:?} does not match rank {}", x.rank()));
                }
                for &p in perm {
                    if p >= x.rank() || seen[p] {
                        return Err(format!("invalid permutation {perm:?}"));
                    }
                    seen[p] = true;
                }
                let shape = perm.iter().map(|&p| x.shape[p]).collect::<Vec<_>>();
                Ok(TensorType::new(x.dtype, shape))
            }
            Op::Slice { axis, start, len } => {
                let x = inputs[0];
                require_axis(x, *axis)?;
                if *len == 0 || start + len > x.shape[*axis] {
                    return Err(format!(
                        "slice {start}..{} out of range for axis {axis} of {}",
                        start + len,
                        x.shape_string()
                    ));
                }
                let mut shape = x.shape.clone();
                shape[*axis] = *len;
                Ok(TensorType::new(x.dtype, shape))
            }
            Op::Select { axis, index } => {
                let x = inputs[0];
                require_axis(x, *axis)?;
                if *index >= x.shape[*axis] {
                    return Err(format!(
                        "index {index} out of range for axis {axis} of {}",
                        x.shape_string()
                    ));
                }
                let mut shape = x.shape.clone();
                shape.remove(*axis);
                Ok(TensorType::new(x.dtype, shape))
            }
            Op::Cast { to } => Ok(TensorType::new(*to, inputs[0].shape.clone())),
        }
    }
}

fn require_dtype(ty: &TensorType, dtype: DType, role: &str) -> Result<(), String> {
    if ty.dtype != dtype {
        return Err(format!("{role} must be {dtype}, got {}", ty.dtype));
    }
    Ok(())
}

fn require_axis(ty: &TensorType, axis: usize) -> Result<(), String> {
    if axis >= ty.rank() {
        return Err(format!("axis {axis} out of range for {}", ty.shape_string()));
    }
    Ok(())
}

/// Right-aligned numpy broadcasting.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast() {
        assert_eq!(broadcast_shapes(&[1, 2, 4, 4], &[1, 1, 1, 4]), Some(vec![1, 2, 4, 4]));
        assert_eq!(broadcast_shapes(&[1, 4, 8], &[8]), Some(vec![1, 4, 8]));
        assert_eq!(broadcast_shapes(&[3, 4], &[5, 4]), None);
    }

    #[test]
    fn test_gather_infers_hidden_dim() {
        let table = TensorType::float([30, 8]);
        let ids = TensorType::int([1, 16]);
        let out = Op::Gather.infer(&[&table, &ids]).unwrap();
        assert_eq!(out, TensorType::float([1, 16, 8]));

        let float_ids = TensorType::float([1, 16]);
        assert!(Op::Gather.infer(&[&table, &float_ids]).is_err());
    }

    #[test]
    fn test_linear_checks_features() {
        let x = TensorType::float([1, 16, 8]);
        let w = TensorType::float([3, 8]);
        let b = TensorType::float([3]);
        assert_eq!(
            Op::Linear.infer(&[&x, &w, &b]).unwrap(),
            TensorType::float([1, 16, 3])
        );

        let bad_w = TensorType::float([3, 7]);
        assert!(Op::Linear.infer(&[&x, &bad_w, &b]).is_err());
    }

    #[test]
    fn test_matmul_and_transpose() {
        let q = TensorType::float([1, 2, 16, 4]);
        let k_t = Op::Transpose { perm: vec![0, 1, 3, 2] }.infer(&[&q]).unwrap();
        assert_eq!(k_t.shape, vec![1, 2, 4, 16]);
        let scores = Op::MatMul.infer(&[&q, &k_t]).unwrap();
        assert_eq!(scores.shape, vec![1, 2, 16, 16]);
    }

    #[test]
    fn test_select_and_slice() {
        let x = TensorType::float([1, 16, 8]);
        let cls = Op::Select { axis: 1, index: 0 }.infer(&[&x]).unwrap();
        assert_eq!(cls.shape, vec![1, 8]);
        assert!(Op::Select { axis: 1, index: 16 }.infer(&[&x]).is_err());

        let table = TensorType::float([512, 8]);
        let positions = Op::Slice { axis: 0, start: 0, len: 64 }.infer(&[&table]).unwrap();
        assert_eq!(positions.shape, vec![64, 8]);
        assert!(Op::Slice { axis: 0, start: 0, len: 513 }.infer(&[&table]).is_err());
    }

    #[test]
    fn test_reshape_preserves_numel() {
        let x = TensorType::int([1, 16]);
        let ok = Op::Reshape { shape: vec![1, 1, 1, 16] }.infer(&[&x]).unwrap();
        assert_eq!(ok.dtype, DType::Int32);
        assert!(Op::Reshape { shape: vec![1, 15] }.infer(&[&x]).is_err());
    }

    #[test]
    fn test_spec_versions() {
        assert_eq!(Op::Add.min_spec_version(), 1);
        assert_eq!(Op::LayerNorm { eps: 1e-12 }.min_spec_version(), 2);
        assert_eq!(Op::CumSum { axis: 1 }.min_spec_version(), LATEST_SPEC_VERSION);
    }

    #[test]
    fn test_op_serializes_tagged() {
        let json = serde_json::to_value(Op::Select { axis: 1, index: 0 }).unwrap();
        assert_eq!(json["op"], "select");
        assert_eq!(json["axis"], 1);
        let back: Op = serde_json::from_value(json).unwrap();
        assert_eq!(back, Op::Select { axis: 1, index: 0 });
    }
}
