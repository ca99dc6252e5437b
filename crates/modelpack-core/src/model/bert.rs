//! BERT and RoBERTa encoders.
//!
//! The two families share the block layout and weight naming; they differ in
//! how position ids are derived and in the sequence-classification head.

use crate::error::{ConvertError, Result};
use crate::graph::{DType, Op, Tracer, ValueId};
use crate::registry::ModelKind;

use super::config::{ArchitectureConfig, ModelFamily};
use super::layers::{
    encoder_block, first_token, layer_norm, leading_positions, linear, mask_bias, param,
    BlockNames, BlockShape,
};
use super::weights::WeightStore;
use super::{EncoderModel, ModelOutput};

pub struct BertEncoder {
    family: ModelFamily,
    kind: ModelKind,
    prefix: String,
    layers: usize,
    block: BlockShape,
    max_positions: usize,
    pad_id: u32,
}

impl BertEncoder {
    pub fn new(family: ModelFamily, kind: ModelKind, config: &ArchitectureConfig, prefix: String) -> Self {
        let pad_id = config.pad_id();
        let max_positions = match family {
            // RoBERTa positions start after the padding index.
            ModelFamily::Roberta => config
                .max_position_embeddings
                .saturating_sub(pad_id as usize + 1),
            _ => config.max_position_embeddings,
        };
        Self {
            family,
            kind,
            prefix,
            layers: config.num_hidden_layers,
            block: BlockShape {
                heads: config.num_attention_heads,
                eps: config.layer_norm_eps,
                activation: config.activation(),
            },
            max_positions,
            pad_id,
        }
    }

    fn name(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    fn block_names(&self, layer: usize) -> BlockNames {
        let base = self.name(&format!("encoder.layer.{layer}"));
        BlockNames {
            query: format!("{base}.attention.self.query"),
            key: format!("{base}.attention.self.key"),
            value: format!("{base}.attention.self.value"),
            attention_output: format!("{base}.attention.output.dense"),
            attention_norm: format!("{base}.attention.output.LayerNorm"),
            ffn_in: format!("{base}.intermediate.dense"),
            ffn_out: format!("{base}.output.dense"),
            output_norm: format!("{base}.output.LayerNorm"),
        }
    }

    /// RoBERTa position ids: `cumsum(mask) * mask + pad_id`, so padding keeps
    /// the padding position.
    fn roberta_positions(
        &self,
        tracer: &mut Tracer,
        store: &WeightStore,
        attention_mask: ValueId,
    ) -> Result<ValueId> {
        let seq = tracer.ty(attention_mask).last_dim();
        if seq > self.max_positions {
            return Err(ConvertError::tracing(format!(
                "max_length {seq} exceeds the position embedding table ({} positions)",
                self.max_positions
            )));
        }
        let mask = tracer.apply(Op::Cast { to: DType::Float32 }, &[attention_mask])?;
        let counts = tracer.apply(Op::CumSum { axis: 1 }, &[mask])?;
        let counts = tracer.apply(Op::Mul, &[counts, mask])?;
        let ids = tracer.apply(
            Op::Affine {
                mul: 1.0,
                add: f64::from(self.pad_id),
            },
            &[counts],
        )?;
        let ids = tracer.apply(Op::Cast { to: DType::Int32 }, &[ids])?;
        let table = param(tracer, store, &self.name("embeddings.position_embeddings.weight"))?;
        tracer.apply(Op::Gather, &[table, ids])
    }
}

impl EncoderModel for BertEncoder {
    fn family(&self) -> ModelFamily {
        self.family
    }

    fn kind(&self) -> ModelKind {
        self.kind
    }

    fn max_positions(&self) -> usize {
        self.max_positions
    }

    fn forward(
        &self,
        tracer: &mut Tracer,
        store: &WeightStore,
        input_ids: ValueId,
        attention_mask: ValueId,
    ) -> Result<ModelOutput> {
        let seq = tracer.ty(input_ids).last_dim();

        let words = param(tracer, store, &self.name("embeddings.word_embeddings.weight"))?;
        let mut embeddings = tracer.apply(Op::Gather, &[words, input_ids])?;

        let positions = match self.family {
            ModelFamily::Roberta => self.roberta_positions(tracer, store, attention_mask)?,
            _ => leading_positions(
                tracer,
                store,
                &self.name("embeddings.position_embeddings.weight"),
                seq,
            )?,
        };
        embeddings = tracer.apply(Op::Add, &[embeddings, positions])?;

        // Every token gets segment 0.
        let token_types = self.name("embeddings.token_type_embeddings.weight");
        if store.contains(&token_types) {
            let table = param(tracer, store, &token_types)?;
            let segment = tracer.apply(Op::Select { axis: 0, index: 0 }, &[table])?;
            embeddings = tracer.apply(Op::Add, &[embeddings, segment])?;
        }
        let mut hidden = layer_norm(
            tracer,
            store,
            embeddings,
            &self.name("embeddings.LayerNorm"),
            self.block.eps,
        )?;

        let bias = mask_bias(tracer, attention_mask)?;
        let mut hidden_states = vec![hidden];
        let mut attentions = Vec::with_capacity(self.layers);
        for layer in 0..self.layers {
            let out = encoder_block(tracer, store, hidden, bias, &self.block_names(layer), self.block)?;
            hidden = out.hidden;
            hidden_states.push(hidden);
            attentions.push(out.attention_probs);
        }

        let pooler_output = if store.contains(&self.name("pooler.dense.weight")) {
            let cls = first_token(tracer, hidden)?;
            let pooled = linear(tracer, store, cls, &self.name("pooler.dense"))?;
            Some(tracer.apply(Op::Tanh, &[pooled])?)
        } else {
            None
        };

        let logits = match self.kind {
            ModelKind::Embedding => None,
            ModelKind::SequenceClassification => Some(match self.family {
                ModelFamily::Roberta => {
                    let cls = first_token(tracer, hidden)?;
                    let dense = linear(tracer, store, cls, "classifier.dense")?;
                    let dense = tracer.apply(Op::Tanh, &[dense])?;
                    linear(tracer, store, dense, "classifier.out_proj")?
                }
                _ => {
                    let pooled = pooler_output.ok_or_else(|| {
                        ConvertError::tracing("missing weight pooler.dense.weight")
                    })?;
                    linear(tracer, store, pooled, "classifier")?
                }
            }),
            ModelKind::TokenClassification => Some(linear(tracer, store, hidden, "classifier")?),
        };

        Ok(ModelOutput {
            last_hidden_state: hidden,
            pooler_output,
            logits,
            hidden_states,
            attentions,
        })
    }
}
