//! Reference CPU kernels for every [`Op`], built on candle.
//!
//! Int32 graph values are held as candle `I64` tensors; indices are narrowed
//! to `U32` only where candle requires it.

use candle_core::{DType as CandleDType, Device, Tensor, D};

use super::ops::Op;
use super::types::DType;

/// Candle storage dtype for a graph dtype.
pub fn storage_dtype(dtype: DType) -> CandleDType {
    match dtype {
        DType::Int32 => CandleDType::I64,
        DType::Float32 => CandleDType::F32,
    }
}

/// Build an int32 graph value from host data.
pub fn int_tensor(data: &[i32], shape: &[usize]) -> candle_core::Result<Tensor> {
    let wide: Vec<i64> = data.iter().map(|&v| i64::from(v)).collect();
    Tensor::from_vec(wide, shape, &Device::Cpu)
}

/// Evaluate one operation on concrete tensors.
pub fn eval(op: &Op, inputs: &[&Tensor]) -> candle_core::Result<Tensor> {
    match op {
        Op::Gather => {
            let (table, indices) = (inputs[0], inputs[1]);
            let flat = indices.flatten_all()?.to_dtype(CandleDType::U32)?;
            let rows = table.index_select(&flat, 0)?;
            let mut shape = indices.dims().to_vec();
            shape.push(table.dim(1)?);
            rows.reshape(shape)
        }
        Op::Add => inputs[0].broadcast_add(inputs[1]),
        Op::Sub => inputs[0].broadcast_sub(inputs[1]),
        Op::Mul => inputs[0].broadcast_mul(inputs[1]),
        Op::Div => inputs[0].broadcast_div(inputs[1]),
        Op::MatMul => inputs[0].contiguous()?.matmul(&inputs[1].contiguous()?),
        Op::Linear => {
            let (x, w, b) = (inputs[0], inputs[1], inputs[2]);
            x.broadcast_matmul(&w.t()?)?.broadcast_add(b)
        }
        Op::LayerNorm { eps } => layer_norm(inputs[0], inputs[1], inputs[2], *eps),
        Op::Softmax => candle_nn::ops::softmax(inputs[0], D::Minus1),
        Op::Gelu { approximate } => {
            if *approximate {
                inputs[0].gelu()
            } else {
                inputs[0].gelu_erf()
            }
        }
        Op::Tanh => inputs[0].tanh(),
        Op::Relu => inputs[0].relu(),
        Op::Reshape { shape } => inputs[0].reshape(shape.clone()),
        Op::Transpose { perm } => inputs[0].permute(perm.clone())?.contiguous(),
        Op::Slice { axis, start, len } => inputs[0].narrow(*axis, *start, *len)?.contiguous(),
        Op::Select { axis, index } => inputs[0]
            .narrow(*axis, *index, 1)?
            .squeeze(*axis)?
            .contiguous(),
        Op::Cast { to } => inputs[0].to_dtype(storage_dtype(*to)),
        Op::Affine { mul, add } => inputs[0].affine(*mul, *add),
        Op::CumSum { axis } => inputs[0].cumsum(*axis),
    }
}

/// `gamma * (x - mean) / sqrt(var + eps) + beta` over the last axis.
fn layer_norm(x: &Tensor, gamma: &Tensor, beta: &Tensor, eps: f64) -> candle_core::Result<Tensor> {
    let mean = x.mean_keepdim(D::Minus1)?;
    let diff = x.broadcast_sub(&mean)?;
    let variance = diff.sqr()?.mean_keepdim(D::Minus1)?;
    let std = (variance + eps)?.sqrt()?;
    diff.broadcast_div(&std)?
        .broadcast_mul(gamma)?
        .broadcast_add(beta)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(data: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_gather_rows() {
        let table = floats(&[0.0, 1.0, 10.0, 11.0, 20.0, 21.0], &[3, 2]);
        let ids = int_tensor(&[2, 0], &[1, 2]).unwrap();
        let out = eval(&Op::Gather, &[&table, &ids]).unwrap();
        assert_eq!(out.dims(), &[1, 2, 2]);
        let rows: Vec<Vec<Vec<f32>>> = out.to_vec3().unwrap();
        assert_eq!(rows[0][0], vec![20.0, 21.0]);
        assert_eq!(rows[0][1], vec![0.0, 1.0]);
    }

    #[test]
    fn test_linear_uses_out_in_weight() {
        let x = floats(&[1.0, 2.0], &[1, 2]);
        let w = floats(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], &[3, 2]);
        let b = floats(&[0.5, 0.0, -1.0], &[3]);
        let out = eval(&Op::Linear, &[&x, &w, &b]).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![1.5, 2.0, 2.0]]);
    }

    #[test]
    fn test_layer_norm_centers() {
        let x = floats(&[1.0, 2.0, 3.0, 4.0], &[1, 4]);
        let gamma = floats(&[1.0; 4], &[4]);
        let beta = floats(&[0.0; 4], &[4]);
        let out = eval(&Op::LayerNorm { eps: 1e-12 }, &[&x, &gamma, &beta]).unwrap();
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let sum: f32 = values.iter().sum();
        assert!(sum.abs() < 1e-5);
        assert!(values[0] < 0.0 && values[3] > 0.0);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = floats(&[1.0, 2.0, 3.0, 0.0, 0.0, 0.0], &[2, 3]);
        let out = eval(&Op::Softmax, &[&x]).unwrap();
        for row in out.to_vec2::<f32>().unwrap() {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_cumsum_and_cast() {
        let mask = int_tensor(&[1, 1, 1, 0], &[1, 4]).unwrap();
        let as_float = eval(&Op::Cast { to: DType::Float32 }, &[&mask]).unwrap();
        let summed = eval(&Op::CumSum { axis: 1 }, &[&as_float]).unwrap();
        assert_eq!(summed.to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0, 3.0, 3.0]]);

        let back = eval(&Op::Cast { to: DType::Int32 }, &[&summed]).unwrap();
        assert_eq!(back.dtype(), CandleDType::I64);
    }

    #[test]
    fn test_select_drops_axis() {
        let x = floats(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[1, 3, 2]);
        let out = eval(&Op::Select { axis: 1, index: 0 }, &[&x]).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0]]);
    }
}
