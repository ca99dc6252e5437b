//! Encoder implementations traced into graphs.
//!
//! Each family builds its forward pass out of [`Op`](crate::graph::Op)s on a
//! [`Tracer`]; the weights come from a [`WeightStore`] loaded from safetensors.

mod bert;
pub mod config;
mod distilbert;
mod layers;
pub mod weights;

use crate::error::{ConvertError, Result};
use crate::graph::{Tracer, ValueId};
use crate::registry::ModelKind;

pub use bert::BertEncoder;
pub use config::{Activation, ArchitectureConfig, ModelFamily};
pub use distilbert::DistilBertEncoder;
pub use weights::WeightStore;

/// Values produced by one traced forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub last_hidden_state: ValueId,
    pub pooler_output: Option<ValueId>,
    /// Task head scores; present for classification kinds.
    pub logits: Option<ValueId>,
    /// Embedding output followed by every block's output.
    pub hidden_states: Vec<ValueId>,
    /// Attention probabilities of every block.
    pub attentions: Vec<ValueId>,
}

/// A transformer encoder that can be traced.
pub trait EncoderModel: Send + Sync {
    fn family(&self) -> ModelFamily;

    fn kind(&self) -> ModelKind;

    /// Longest sequence the position embeddings cover.
    fn max_positions(&self) -> usize;

    fn forward(
        &self,
        tracer: &mut Tracer,
        store: &WeightStore,
        input_ids: ValueId,
        attention_mask: ValueId,
    ) -> Result<ModelOutput>;
}

/// Select the implementation for a `(kind, architecture)` pair.
pub fn build_module(
    kind: ModelKind,
    config: &ArchitectureConfig,
    store: &WeightStore,
) -> Result<Box<dyn EncoderModel>> {
    let family = config.family().ok_or_else(|| ConvertError::UnsupportedKind {
        kind: kind.as_str().to_string(),
        architecture: Some(if config.model_type.is_empty() {
            "unknown".to_string()
        } else {
            config.model_type.clone()
        }),
    })?;

    // Task checkpoints nest the base model under its family name.
    let nested = family.weight_prefix();
    let prefix = if store.contains(&format!("{nested}embeddings.word_embeddings.weight")) {
        nested.to_string()
    } else {
        String::new()
    };

    let module: Box<dyn EncoderModel> = match family {
        ModelFamily::Bert | ModelFamily::Roberta => {
            Box::new(BertEncoder::new(family, kind, config, prefix))
        }
        ModelFamily::DistilBert => Box::new(DistilBertEncoder::new(kind, config, prefix)),
    };
    Ok(module)
}
