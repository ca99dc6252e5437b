//! DistilBERT encoder: BERT blocks without token types or pooler.

use crate::error::Result;
use crate::graph::{Op, Tracer, ValueId};
use crate::registry::ModelKind;

use super::config::{ArchitectureConfig, ModelFamily};
use super::layers::{
    encoder_block, first_token, layer_norm, leading_positions, linear, mask_bias, param,
    BlockNames, BlockShape,
};
use super::weights::WeightStore;
use super::{EncoderModel, ModelOutput};

pub struct DistilBertEncoder {
    kind: ModelKind,
    prefix: String,
    layers: usize,
    block: BlockShape,
    max_positions: usize,
}

impl DistilBertEncoder {
    pub fn new(kind: ModelKind, config: &ArchitectureConfig, prefix: String) -> Self {
        Self {
            kind,
            prefix,
            layers: config.num_hidden_layers,
            block: BlockShape {
                heads: config.num_attention_heads,
                eps: config.layer_norm_eps,
                activation: config.activation(),
            },
            max_positions: config.max_position_embeddings,
        }
    }

    fn name(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    fn block_names(&self, layer: usize) -> BlockNames {
        let base = self.name(&format!("transformer.layer.{layer}"));
        BlockNames {
            query: format!("{base}.attention.q_lin"),
            key: format!("{base}.attention.k_lin"),
            value: format!("{base}.attention.v_lin"),
            attention_output: format!("{base}.attention.out_lin"),
            attention_norm: format!("{base}.sa_layer_norm"),
            ffn_in: format!("{base}.ffn.lin1"),
            ffn_out: format!("{base}.ffn.lin2"),
            output_norm: format!("{base}.output_layer_norm"),
        }
    }
}

impl EncoderModel for DistilBertEncoder {
    fn family(&self) -> ModelFamily {
        ModelFamily::DistilBert
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
        let words = tracer.apply(Op::Gather, &[words, input_ids])?;
        let positions = leading_positions(
            tracer,
            store,
            &self.name("embeddings.position_embeddings.weight"),
            seq,
        )?;
        let embeddings = tracer.apply(Op::Add, &[words, positions])?;
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

        let logits = match self.kind {
            ModelKind::Embedding => None,
            ModelKind::SequenceClassification => {
                let cls = first_token(tracer, hidden)?;
                let pre = linear(tracer, store, cls, "pre_classifier")?;
                let pre = tracer.apply(Op::Relu, &[pre])?;
                Some(linear(tracer, store, pre, "classifier")?)
            }
            ModelKind::TokenClassification => Some(linear(tracer, store, hidden, "classifier")?),
        };

        Ok(ModelOutput {
            last_hidden_state: hidden,
            pooler_output: None,
            logits,
            hidden_states,
            attentions,
        })
    }
}
