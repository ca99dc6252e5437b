//! Traced building blocks shared by the encoder families.

use crate::config::PipelineConfig;
use crate::error::{ConvertError, Result};
use crate::graph::{DType, Op, Tracer, ValueId};

use super::config::Activation;
use super::weights::WeightStore;

/// Bind a checkpoint weight into the trace.
pub fn param(tracer: &mut Tracer, store: &WeightStore, name: &str) -> Result<ValueId> {
    let tensor = store.require(name)?;
    Ok(tracer.weight(name, tensor))
}

/// `x @ W^T + b` with `W` and `b` stored under `<prefix>.weight` / `<prefix>.bias`.
pub fn linear(tracer: &mut Tracer, store: &WeightStore, x: ValueId, prefix: &str) -> Result<ValueId> {
    let w = param(tracer, store, &format!("{prefix}.weight"))?;
    let b = param(tracer, store, &format!("{prefix}.bias"))?;
    tracer.apply(Op::Linear, &[x, w, b])
}

/// Layer norm over the last axis. Older checkpoints store `gamma`/`beta`.
pub fn layer_norm(
    tracer: &mut Tracer,
    store: &WeightStore,
    x: ValueId,
    prefix: &str,
    eps: f64,
) -> Result<ValueId> {
    let (scale, shift) = if store.contains(&format!("{prefix}.gamma")) {
        ("gamma", "beta")
    } else {
        ("weight", "bias")
    };
    let gamma = param(tracer, store, &format!("{prefix}.{scale}"))?;
    let beta = param(tracer, store, &format!("{prefix}.{shift}"))?;
    tracer.apply(Op::LayerNorm { eps }, &[x, gamma, beta])
}

pub fn activation(tracer: &mut Tracer, x: ValueId, act: Activation) -> Result<ValueId> {
    let op = match act {
        Activation::Gelu => Op::Gelu { approximate: false },
        Activation::GeluApprox => Op::Gelu { approximate: true },
        Activation::Relu => Op::Relu,
    };
    tracer.apply(op, &[x])
}

/// Additive attention bias `(1 - mask) * -10000`, shaped `(batch, 1, 1, seq)`.
pub fn mask_bias(tracer: &mut Tracer, attention_mask: ValueId) -> Result<ValueId> {
    let shape = tracer.ty(attention_mask).shape.clone();
    let [batch, seq] = shape[..] else {
        return Err(ConvertError::tracing(format!(
            "attention mask must be rank 2, got {}",
            tracer.ty(attention_mask)
        )));
    };
    let mask = tracer.apply(Op::Cast { to: DType::Float32 }, &[attention_mask])?;
    let bias = tracer.apply(
        Op::Affine {
            mul: -PipelineConfig::MASK_BIAS,
            add: PipelineConfig::MASK_BIAS,
        },
        &[mask],
    )?;
    tracer.apply(
        Op::Reshape {
            shape: vec![batch, 1, 1, seq],
        },
        &[bias],
    )
}

/// Weight names of one post-norm transformer block.
#[derive(Debug, Clone)]
pub struct BlockNames {
    pub query: String,
    pub key: String,
    pub value: String,
    pub attention_output: String,
    pub attention_norm: String,
    pub ffn_in: String,
    pub ffn_out: String,
    pub output_norm: String,
}

/// Hyperparameters of one transformer block.
#[derive(Debug, Clone, Copy)]
pub struct BlockShape {
    pub heads: usize,
    pub eps: f64,
    pub activation: Activation,
}

/// Output of one traced block.
pub struct BlockOutput {
    pub hidden: ValueId,
    pub attention_probs: ValueId,
}

/// Multi-head self-attention followed by the feed-forward sublayer, each with
/// a residual connection and a trailing layer norm.
pub fn encoder_block(
    tracer: &mut Tracer,
    store: &WeightStore,
    hidden: ValueId,
    bias: ValueId,
    names: &BlockNames,
    shape: BlockShape,
) -> Result<BlockOutput> {
    let dims = tracer.ty(hidden).shape.clone();
    let [batch, seq, width] = dims[..] else {
        return Err(ConvertError::tracing(format!(
            "hidden states must be rank 3, got {}",
            tracer.ty(hidden)
        )));
    };
    let head_dim = width / shape.heads;

    let split = vec![batch, seq, shape.heads, head_dim];
    let q = linear(tracer, store, hidden, &names.query)?;
    let q = tracer.apply(Op::Reshape { shape: split.clone() }, &[q])?;
    let q = tracer.apply(Op::Transpose { perm: vec![0, 2, 1, 3] }, &[q])?;

    let k = linear(tracer, store, hidden, &names.key)?;
    let k = tracer.apply(Op::Reshape { shape: split.clone() }, &[k])?;
    let k_t = tracer.apply(Op::Transpose { perm: vec![0, 2, 3, 1] }, &[k])?;

    let v = linear(tracer, store, hidden, &names.value)?;
    let v = tracer.apply(Op::Reshape { shape: split }, &[v])?;
    let v = tracer.apply(Op::Transpose { perm: vec![0, 2, 1, 3] }, &[v])?;

    let scores = tracer.apply(Op::MatMul, &[q, k_t])?;
    let scores = tracer.apply(
        Op::Affine {
            mul: 1.0 / (head_dim as f64).sqrt(),
            add: 0.0,
        },
        &[scores],
    )?;
    let scores = tracer.apply(Op::Add, &[scores, bias])?;
    let probs = tracer.apply(Op::Softmax, &[scores])?;

    let context = tracer.apply(Op::MatMul, &[probs, v])?;
    let context = tracer.apply(Op::Transpose { perm: vec![0, 2, 1, 3] }, &[context])?;
    let context = tracer.apply(
        Op::Reshape {
            shape: vec![batch, seq, width],
        },
        &[context],
    )?;

    let attended = linear(tracer, store, context, &names.attention_output)?;
    let attended = tracer.apply(Op::Add, &[attended, hidden])?;
    let attended = layer_norm(tracer, store, attended, &names.attention_norm, shape.eps)?;

    let inner = linear(tracer, store, attended, &names.ffn_in)?;
    let inner = activation(tracer, inner, shape.activation)?;
    let out = linear(tracer, store, inner, &names.ffn_out)?;
    let out = tracer.apply(Op::Add, &[out, attended])?;
    let out = layer_norm(tracer, store, out, &names.output_norm, shape.eps)?;

    Ok(BlockOutput {
        hidden: out,
        attention_probs: probs,
    })
}

/// Hidden state of the first (`[CLS]` / `<s>`) token: `(batch, width)`.
pub fn first_token(tracer: &mut Tracer, hidden: ValueId) -> Result<ValueId> {
    tracer.apply(Op::Select { axis: 1, index: 0 }, &[hidden])
}

/// Learned absolute positions `0..seq`, as `(seq, width)`.
pub fn leading_positions(
    tracer: &mut Tracer,
    store: &WeightStore,
    table_name: &str,
    seq: usize,
) -> Result<ValueId> {
    let table = store.require(table_name)?;
    let rows = table.dims().first().copied().unwrap_or(0);
    if seq > rows {
        return Err(ConvertError::tracing(format!(
            "max_length {seq} exceeds the position embedding table ({rows} positions)"
        )));
    }
    let table = tracer.weight(table_name, table);
    tracer.apply(
        Op::Slice {
            axis: 0,
            start: 0,
            len: seq,
        },
        &[table],
    )
}
