//! Graph freezing: trace a materialized model once on a fixed-shape sample.

use tracing::info;

use crate::config::PipelineConfig;
use crate::error::{ConvertError, Result};
use crate::graph::{FrozenGraph, TensorType, Tracer, ValueId};
use crate::materialize::{MaterializedModel, Preprocessor};
use crate::model::ModelOutput;
use crate::registry::ModelKind;

pub const LAST_HIDDEN_STATE: &str = "last_hidden_state";
pub const POOLER_OUTPUT: &str = "pooler_output";
pub const LOGITS: &str = "logits";

/// Fixed-shape `(1, max_length)` tokenization of the probe text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleInput {
    pub input_ids: Vec<i32>,
    pub attention_mask: Vec<i32>,
    pub max_length: usize,
}

impl SampleInput {
    pub fn from_text(
        preprocessor: &Preprocessor,
        text: &str,
        max_length: usize,
        pad_id: u32,
    ) -> Result<Self> {
        if max_length == 0 {
            return Err(ConvertError::tracing("max_length must be positive"));
        }
        let (input_ids, attention_mask) = preprocessor.encode_fixed(text, max_length, pad_id)?;
        Ok(Self {
            input_ids,
            attention_mask,
            max_length,
        })
    }

    /// Tokenize the probe text with the model's own tokenizer and pad id.
    pub fn probe(model: &MaterializedModel, max_length: usize) -> Result<Self> {
        Self::from_text(
            &model.preprocessor,
            PipelineConfig::PROBE_TEXT,
            max_length,
            model.config.pad_id(),
        )
    }

    pub fn shape(&self) -> [usize; 2] {
        [1, self.max_length]
    }

    pub fn tensor_type(&self) -> TensorType {
        TensorType::int(self.shape())
    }
}

/// Decides which model outputs become graph outputs, and how strictly the
/// trace is checked.
pub trait GraphAdapter {
    fn strict(&self) -> bool;

    fn select_outputs(&self, output: ModelOutput) -> Result<Vec<(String, ValueId)>>;
}

/// Embedding models: keep the model's own named outputs.
pub struct NativeOutputs;

impl GraphAdapter for NativeOutputs {
    fn strict(&self) -> bool {
        false
    }

    fn select_outputs(&self, output: ModelOutput) -> Result<Vec<(String, ValueId)>> {
        let mut outputs = vec![(LAST_HIDDEN_STATE.to_string(), output.last_hidden_state)];
        if let Some(pooled) = output.pooler_output {
            outputs.push((POOLER_OUTPUT.to_string(), pooled));
        }
        Ok(outputs)
    }
}

/// Classification models: only the raw scores survive.
pub struct LogitsOnly;

impl GraphAdapter for LogitsOnly {
    fn strict(&self) -> bool {
        true
    }

    fn select_outputs(&self, output: ModelOutput) -> Result<Vec<(String, ValueId)>> {
        let logits = output
            .logits
            .ok_or_else(|| ConvertError::tracing("classification model produced no logits"))?;
        Ok(vec![(LOGITS.to_string(), logits)])
    }
}

pub fn adapter_for(kind: ModelKind) -> Box<dyn GraphAdapter> {
    match kind {
        ModelKind::Embedding => Box::new(NativeOutputs),
        ModelKind::SequenceClassification | ModelKind::TokenClassification => Box::new(LogitsOnly),
    }
}

/// Traces materialized models into [`FrozenGraph`]s.
pub struct GraphFreezer;

impl GraphFreezer {
    pub fn freeze(model: &MaterializedModel, max_length: usize) -> Result<(FrozenGraph, SampleInput)> {
        let positions = model.module.max_positions();
        if max_length > positions {
            return Err(ConvertError::tracing(format!(
                "max_length {max_length} exceeds the position embedding table ({positions} positions)"
            )));
        }

        let sample = SampleInput::probe(model, max_length)?;
        let adapter = adapter_for(model.module.kind());
        let mut tracer = Tracer::new(adapter.strict());
        let shape = sample.shape();
        let input_ids = tracer.input(PipelineConfig::INPUT_IDS, &sample.input_ids, &shape)?;
        let attention_mask =
            tracer.input(PipelineConfig::ATTENTION_MASK, &sample.attention_mask, &shape)?;

        let output = model
            .module
            .forward(&mut tracer, &model.weights, input_ids, attention_mask)?;
        let outputs = adapter.select_outputs(output)?;
        let graph = tracer.finish(outputs)?;

        info!(
            "Froze {} into {} nodes with outputs {:?}",
            model.source_id,
            graph.nodes().len(),
            graph.output_names()
        );
        Ok((graph, sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materialize::load_dir;
    use crate::registry::ConversionSpec;
    use crate::test_support::{tokenizer_json, FixtureFamily};
    use tempfile::TempDir;

    fn materialize(family: FixtureFamily, kind: ModelKind, labels: Option<usize>) -> (TempDir, MaterializedModel) {
        let dir = TempDir::new().unwrap();
        family.write_checkpoint(dir.path(), labels);
        let spec = ConversionSpec::new(dir.path().to_string_lossy(), kind, "fixture");
        let model = load_dir(dir.path(), "fixture", &spec).unwrap();
        (dir, model)
    }

    #[test]
    fn test_sample_shape_follows_max_length() {
        let pre = Preprocessor::from_json_str(&tokenizer_json(), "test").unwrap();
        let sample = SampleInput::from_text(&pre, PipelineConfig::PROBE_TEXT, 128, 0).unwrap();
        assert_eq!(sample.shape(), [1, 128]);
        assert_eq!(sample.input_ids.len(), 128);
        assert_eq!(&sample.input_ids[..4], &[2, 4, 5, 3]);
        assert_eq!(sample.attention_mask.iter().sum::<i32>(), 4);
        assert_eq!(sample.tensor_type(), TensorType::int([1, 128]));
    }

    #[test]
    fn test_default_max_length_sample_shape() {
        let dir = TempDir::new().unwrap();
        FixtureFamily::Bert.write_checkpoint_with_positions(dir.path(), None, PipelineConfig::DEFAULT_MAX_LENGTH);
        let spec = ConversionSpec::new(dir.path().to_string_lossy(), ModelKind::Embedding, "fixture");
        assert_eq!(spec.max_length, PipelineConfig::DEFAULT_MAX_LENGTH);
        let model = load_dir(dir.path(), "fixture", &spec).unwrap();

        let sample = SampleInput::probe(&model, spec.max_length).unwrap();
        assert_eq!(sample.shape(), [1, 512]);
        assert_eq!(sample.input_ids.len(), 512);
        assert_eq!(sample.attention_mask.len(), 512);

        let (graph, sample) = GraphFreezer::freeze(&model, spec.max_length).unwrap();
        assert_eq!(sample.shape(), [1, 512]);
        assert_eq!(graph.input_type("input_ids").unwrap(), &TensorType::int([1, 512]));
        assert_eq!(graph.input_type("attention_mask").unwrap(), &TensorType::int([1, 512]));
    }

    #[test]
    fn test_embedding_keeps_native_outputs() {
        let (_dir, model) = materialize(FixtureFamily::Bert, ModelKind::Embedding, None);
        let (graph, sample) = GraphFreezer::freeze(&model, 16).unwrap();
        assert_eq!(sample.shape(), [1, 16]);
        assert_eq!(graph.output_names(), vec![LAST_HIDDEN_STATE, POOLER_OUTPUT]);
        assert_eq!(
            graph.output_type(LAST_HIDDEN_STATE).unwrap(),
            &TensorType::float([1, 16, 8])
        );
        assert_eq!(graph.input_type("input_ids").unwrap(), &TensorType::int([1, 16]));
    }

    #[test]
    fn test_classification_has_single_logits_output() {
        let (_dir, model) = materialize(FixtureFamily::DistilBert, ModelKind::SequenceClassification, Some(2));
        let (graph, _) = GraphFreezer::freeze(&model, 32).unwrap();
        assert_eq!(graph.output_names(), vec![LOGITS]);
        assert_eq!(graph.output_type(LOGITS).unwrap(), &TensorType::float([1, 2]));
        // The pooler-free head leaves no dangling projections behind.
        assert!(graph.weights().keys().all(|name| !name.contains("pooler")));
    }

    #[test]
    fn test_token_classification_drops_pooler() {
        let (_dir, model) = materialize(FixtureFamily::Bert, ModelKind::TokenClassification, Some(3));
        let (graph, _) = GraphFreezer::freeze(&model, 8).unwrap();
        assert_eq!(graph.output_type(LOGITS).unwrap(), &TensorType::float([1, 8, 3]));
        assert!(graph.weights().keys().all(|name| !name.contains("pooler")));
    }

    #[test]
    fn test_max_length_beyond_positions_fails() {
        let (_dir, model) = materialize(FixtureFamily::Roberta, ModelKind::Embedding, None);
        let err = GraphFreezer::freeze(&model, 128).unwrap_err();
        assert!(matches!(err, ConvertError::Tracing { .. }));
        assert!(GraphFreezer::freeze(&model, 126).is_ok());
    }

    #[test]
    fn test_adapter_policies() {
        assert!(!adapter_for(ModelKind::Embedding).strict());
        assert!(adapter_for(ModelKind::SequenceClassification).strict());
        assert!(adapter_for(ModelKind::TokenClassification).strict());
    }
}
