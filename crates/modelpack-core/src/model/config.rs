//! Architecture configuration read from a checkpoint's `config.json`.

use std::path::Path;

use serde::Deserialize;

use crate::error::{ConvertError, Result};

/// Encoder family implemented by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Bert,
    Roberta,
    DistilBert,
}

impl ModelFamily {
    /// Map a `model_type` string to a family, if supported.
    pub fn from_model_type(model_type: &str) -> Option<Self> {
        match model_type {
            "bert" => Some(ModelFamily::Bert),
            "roberta" | "xlm-roberta" => Some(ModelFamily::Roberta),
            "distilbert" => Some(ModelFamily::DistilBert),
            _ => None,
        }
    }

    /// Prefix the base model's weights carry inside task checkpoints.
    pub fn weight_prefix(&self) -> &'static str {
        match self {
            ModelFamily::Bert => "bert.",
            ModelFamily::Roberta => "roberta.",
            ModelFamily::DistilBert => "distilbert.",
        }
    }
}

/// Feed-forward activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Exact erf-based GELU.
    Gelu,
    /// Tanh approximation of GELU.
    GeluApprox,
    Relu,
}

impl Activation {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "gelu" => Some(Activation::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" | "gelu_fast" => Some(Activation::GeluApprox),
            "relu" => Some(Activation::Relu),
            _ => None,
        }
    }
}

/// Subset of `config.json` used to build an encoder.
///
/// DistilBERT spells its hyperparameters differently; the aliases accept both.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchitectureConfig {
    #[serde(default)]
    pub model_type: String,
    pub vocab_size: usize,
    #[serde(alias = "dim")]
    pub hidden_size: usize,
    #[serde(alias = "n_layers")]
    pub num_hidden_layers: usize,
    #[serde(alias = "n_heads")]
    pub num_attention_heads: usize,
    #[serde(alias = "hidden_dim")]
    pub intermediate_size: usize,
    #[serde(alias = "activation", default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_max_position")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    /// Present when the checkpoint ships its own modeling code.
    #[serde(default)]
    pub auto_map: Option<serde_json::Value>,
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

fn default_max_position() -> usize {
    512
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl ArchitectureConfig {
    /// Read and validate `config.json`.
    pub fn load(path: &Path, source_id: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConvertError::SourceResolution {
            source_id: source_id.to_string(),
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_json_str(&text, source_id)
    }

    pub fn from_json_str(text: &str, source_id: &str) -> Result<Self> {
        let invalid = |message: String| ConvertError::SourceResolution {
            source_id: source_id.to_string(),
            message,
        };
        let config: Self =
            serde_json::from_str(text).map_err(|e| invalid(format!("invalid config.json: {e}")))?;

        if config.num_attention_heads == 0 || config.hidden_size % config.num_attention_heads != 0 {
            return Err(invalid(format!(
                "hidden size {} is not divisible by {} attention heads",
                config.hidden_size, config.num_attention_heads
            )));
        }
        if Activation::parse(&config.hidden_act).is_none() {
            return Err(invalid(format!(
                "unsupported activation {}",
                config.hidden_act
            )));
        }
        Ok(config)
    }

    pub fn family(&self) -> Option<ModelFamily> {
        ModelFamily::from_model_type(&self.model_type)
    }

    pub fn activation(&self) -> Activation {
        Activation::parse(&self.hidden_act).unwrap_or(Activation::Gelu)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Padding id used for the sample input and RoBERTa position offsets.
    pub fn pad_id(&self) -> u32 {
        self.pad_token_id.unwrap_or(match self.family() {
            Some(ModelFamily::Roberta) => 1,
            _ => 0,
        })
    }

    pub fn requires_remote_code(&self) -> bool {
        self.auto_map.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bert_defaults() {
        let json = r#"{
            "model_type": "bert",
            "vocab_size": 30522,
            "hidden_size": 768,
            "num_hidden_layers": 12,
            "num_attention_heads": 12,
            "intermediate_size": 3072
        }"#;
        let config = ArchitectureConfig::from_json_str(json, "test").unwrap();
        assert_eq!(config.family(), Some(ModelFamily::Bert));
        assert_eq!(config.activation(), Activation::Gelu);
        assert_eq!(config.max_position_embeddings, 512);
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.pad_id(), 0);
        assert!(!config.requires_remote_code());
    }

    #[test]
    fn test_distilbert_aliases() {
        let json = r#"{
            "model_type": "distilbert",
            "vocab_size": 30522,
            "dim": 768,
            "n_layers": 6,
            "n_heads": 12,
            "hidden_dim": 3072,
            "activation": "gelu",
            "id2label": {"1": "POSITIVE", "0": "NEGATIVE"}
        }"#;
        let config = ArchitectureConfig::from_json_str(json, "test").unwrap();
        assert_eq!(config.family(), Some(ModelFamily::DistilBert));
        assert_eq!(config.num_hidden_layers, 6);
        assert_eq!(config.intermediate_size, 3072);
    }

    #[test]
    fn test_roberta_pad_default() {
        let json = r#"{"model_type": "xlm-roberta", "vocab_size": 10, "hidden_size": 8,
            "num_hidden_layers": 1, "num_attention_heads": 2, "intermediate_size": 16}"#;
        let config = ArchitectureConfig::from_json_str(json, "test").unwrap();
        assert_eq!(config.family(), Some(ModelFamily::Roberta));
        assert_eq!(config.pad_id(), 1);
    }

    #[test]
    fn test_invalid_configs() {
        let bad_heads = r#"{"vocab_size": 10, "hidden_size": 10, "num_hidden_layers": 1,
            "num_attention_heads": 3, "intermediate_size": 16}"#;
        let err = ArchitectureConfig::from_json_str(bad_heads, "org/model").unwrap_err();
        assert!(matches!(err, ConvertError::SourceResolution { .. }));

        let bad_act = r#"{"vocab_size": 10, "hidden_size": 8, "num_hidden_layers": 1,
            "num_attention_heads": 2, "intermediate_size": 16, "hidden_act": "swish"}"#;
        assert!(ArchitectureConfig::from_json_str(bad_act, "org/model").is_err());

        assert!(ArchitectureConfig::from_json_str("{", "org/model").is_err());
    }
}
