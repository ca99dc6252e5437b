//! Model registry: the declarative `models.yaml` file.
//!
//! ```yaml
//! models:
//!   sentiment:
//!     source: distilbert/distilbert-base-uncased-finetuned-sst-2-english
//!     type: sequence_classification
//!     max_length: 128
//!     quantize: 8
//!     labels: [negative, positive]
//!     output_name: sentiment
//! ```
//!
//! Entries are validated when the file is loaded. An invalid entry does not
//! abort loading: it is kept as a rejected entry and reported as a failure if
//! a run requests it, so one bad line never blocks the rest of the batch.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::{ConvertError, Result};

/// Family of model heads the pipeline knows how to convert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Embedding,
    SequenceClassification,
    TokenClassification,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Embedding => "embedding",
            ModelKind::SequenceClassification => "sequence_classification",
            ModelKind::TokenClassification => "token_classification",
        }
    }

    /// Whether the model ends in a classifier producing raw scores.
    pub fn is_classification(&self) -> bool {
        match self {
            ModelKind::Embedding => false,
            ModelKind::SequenceClassification | ModelKind::TokenClassification => true,
        }
    }
}

impl FromStr for ModelKind {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "embedding" => Ok(ModelKind::Embedding),
            "sequence_classification" => Ok(ModelKind::SequenceClassification),
            "token_classification" => Ok(ModelKind::TokenClassification),
            other => Err(ConvertError::UnsupportedKind {
                kind: other.to_string(),
                architecture: None,
            }),
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validated registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConversionSpec {
    /// Local directory or hub repository id (`org/name[@revision]`).
    pub source: String,
    pub kind: ModelKind,
    pub max_length: usize,
    /// Weight bit-width; `None` leaves weights at float32.
    #[serde(default)]
    pub quantize_bits: Option<u32>,
    /// Classifier labels, index `i` names score `i`.
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub trust_remote_code: bool,
    /// Package directory name under the output root.
    pub output_name: String,
    /// Target runtime spec version; `None` means the latest.
    #[serde(default)]
    pub deployment_target: Option<u32>,
}

impl ConversionSpec {
    /// Create a spec with registry defaults.
    pub fn new(source: impl Into<String>, kind: ModelKind, output_name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind,
            max_length: PipelineConfig::DEFAULT_MAX_LENGTH,
            quantize_bits: None,
            labels: None,
            trust_remote_code: false,
            output_name: output_name.into(),
            deployment_target: None,
        }
    }

    /// Labels to attach as a classifier head, if any.
    ///
    /// Only classification kinds carry a head; validation rejects labels on
    /// other kinds, so this never silently drops configured labels.
    pub fn classifier_labels(&self) -> Option<&[String]> {
        if self.kind.is_classification() {
            self.labels.as_deref().filter(|l| !l.is_empty())
        } else {
            None
        }
    }

    /// Check the entry's invariants.
    pub fn validate(&self, name: &str) -> Result<()> {
        let invalid = |message: String| ConvertError::InvalidSpec {
            name: name.to_string(),
            message,
        };

        if self.source.trim().is_empty() {
            return Err(invalid("source must not be empty".into()));
        }
        if self.max_length == 0 {
            return Err(invalid("max_length must be positive".into()));
        }
        if self.quantize_bits == Some(0) {
            return Err(invalid("quantize must be a positive bit-width".into()));
        }
        if self.deployment_target == Some(0) {
            return Err(invalid("deployment_target must be positive".into()));
        }
        validate_output_name(&self.output_name).map_err(invalid)?;

        if let Some(labels) = &self.labels {
            if !self.kind.is_classification() {
                return Err(invalid(format!(
                    "labels are only valid for classification kinds, not {}",
                    self.kind
                )));
            }
            if labels.is_empty() {
                return Err(invalid("labels must not be empty when present".into()));
            }
            if let Some(blank) = labels.iter().position(|l| l.trim().is_empty()) {
                return Err(invalid(format!("label {blank} is blank")));
            }
        }
        Ok(())
    }
}

fn validate_output_name(output_name: &str) -> std::result::Result<(), String> {
    if output_name.trim().is_empty() {
        return Err("output_name must not be empty".into());
    }
    if output_name == "." || output_name == ".." || output_name.starts_with('.') {
        return Err(format!("output_name {output_name:?} must not start with '.'"));
    }
    if output_name.contains(['/', '\\']) {
        return Err(format!(
            "output_name {output_name:?} must be a single directory name"
        ));
    }
    Ok(())
}

/// Entry as written in the YAML file, before validation.
#[derive(Debug, Clone, Deserialize)]
struct RawEntry {
    source: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    max_length: Option<usize>,
    #[serde(default)]
    quantize: Option<u32>,
    #[serde(default)]
    labels: Option<Vec<String>>,
    #[serde(default)]
    trust_remote_code: bool,
    #[serde(default)]
    output_name: Option<String>,
    #[serde(default)]
    deployment_target: Option<u32>,
}

impl RawEntry {
    fn into_spec(self, name: &str) -> Result<ConversionSpec> {
        let kind = ModelKind::from_str(&self.kind)?;
        let spec = ConversionSpec {
            source: self.source,
            kind,
            max_length: self.max_length.unwrap_or(PipelineConfig::DEFAULT_MAX_LENGTH),
            quantize_bits: self.quantize,
            labels: self.labels,
            trust_remote_code: self.trust_remote_code,
            output_name: self.output_name.unwrap_or_else(|| name.to_string()),
            deployment_target: self.deployment_target,
        };
        spec.validate(name)?;
        Ok(spec)
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    models: serde_yaml::Mapping,
}

/// Read-only mapping from model name to conversion spec.
#[derive(Debug, Default)]
pub struct Registry {
    /// Registry order is preserved for "convert all" runs.
    names: Vec<String>,
    entries: BTreeMap<String, ConversionSpec>,
    rejections: BTreeMap<String, ConvertError>,
}

impl Registry {
    /// Load and validate a registry file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConvertError::Config {
            message: format!("Failed to read registry {}: {}", path.display(), e),
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate registry YAML.
    ///
    /// Only a syntactically broken file is an error; invalid entries are
    /// recorded and surfaced per entry.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: RegistryFile = serde_yaml::from_str(text)?;
        let mut registry = Registry::default();

        for (key, value) in file.models {
            let name = match key {
                serde_yaml::Value::String(s) => s,
                other => {
                    return Err(ConvertError::Config {
                        message: format!("Registry keys must be strings, got {other:?}"),
                    })
                }
            };

            let parsed = serde_yaml::from_value::<RawEntry>(value)
                .map_err(|e| ConvertError::InvalidSpec {
                    name: name.clone(),
                    message: e.to_string(),
                })
                .and_then(|raw| raw.into_spec(&name));

            match parsed {
                Ok(spec) => {
                    debug!("Registry entry {} -> {} ({})", name, spec.source, spec.kind);
                    registry.insert_valid(name, spec);
                }
                Err(e) => {
                    warn!("Rejected registry entry {}: {}", name, e);
                    if !registry.contains(&name) {
                        registry.names.push(name.clone());
                    }
                    registry.rejections.insert(name, e);
                }
            }
        }
        Ok(registry)
    }

    /// Build a registry from already-validated specs, in the given order.
    pub fn from_specs<I, S>(specs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, ConversionSpec)>,
        S: Into<String>,
    {
        let mut registry = Registry::default();
        for (name, spec) in specs {
            let name = name.into();
            spec.validate(&name)?;
            registry.insert_valid(name, spec);
        }
        Ok(registry)
    }

    fn insert_valid(&mut self, name: String, spec: ConversionSpec) {
        if !self.contains(&name) {
            self.names.push(name.clone());
        }
        self.entries.insert(name, spec);
    }

    /// All entry names in registry order, including rejected ones.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name) || self.rejections.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Look up a validated spec.
    ///
    /// Returns `NotFound` for unknown names and the load-time validation
    /// failure for rejected entries.
    pub fn spec(&self, name: &str) -> Result<&ConversionSpec> {
        if let Some(spec) = self.entries.get(name) {
            return Ok(spec);
        }
        match self.rejections.get(name) {
            Some(rejection) => Err(replay_rejection(name, rejection)),
            None => Err(ConvertError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Entries rejected at load time, with the reason.
    pub fn rejected(&self) -> impl Iterator<Item = (&str, &ConvertError)> {
        self.rejections.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Rebuild a load-time rejection for reporting; `ConvertError` is not `Clone`.
fn replay_rejection(name: &str, rejection: &ConvertError) -> ConvertError {
    match rejection {
        ConvertError::UnsupportedKind { kind, architecture } => ConvertError::UnsupportedKind {
            kind: kind.clone(),
            architecture: architecture.clone(),
        },
        ConvertError::InvalidSpec { name, message } => ConvertError::InvalidSpec {
            name: name.clone(),
            message: message.clone(),
        },
        other => ConvertError::InvalidSpec {
            name: name.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    const REGISTRY: &str = r#"
models:
  sentiment:
    source: org/sentiment-model
    type: sequence_classification
    max_length: 64
    quantize: 8
    labels: [neg, pos]
    output_name: sentiment
  embed:
    source: org/embedder
    type: embedding
  broken:
    source: org/broken
    type: embedding
    labels: [a, b]
  vision:
    source: org/vit
    type: image_classification
"#;

    #[test]
    fn test_load_preserves_order_and_defaults() {
        let registry = Registry::from_yaml_str(REGISTRY).unwrap();
        assert_eq!(registry.names(), ["sentiment", "embed", "broken", "vision"]);

        let embed = registry.spec("embed").unwrap();
        assert_eq!(embed.kind, ModelKind::Embedding);
        assert_eq!(embed.max_length, 512);
        assert_eq!(embed.output_name, "embed");
        assert_eq!(embed.quantize_bits, None);
        assert!(!embed.trust_remote_code);

        let sentiment = registry.spec("sentiment").unwrap();
        assert_eq!(sentiment.max_length, 64);
        assert_eq!(sentiment.quantize_bits, Some(8));
        assert_eq!(
            sentiment.classifier_labels(),
            Some(&["neg".to_string(), "pos".to_string()][..])
        );
    }

    #[test]
    fn test_labels_on_embedding_rejected_per_entry() {
        let registry = Registry::from_yaml_str(REGISTRY).unwrap();
        let err = registry.spec("broken").unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::InvalidSpec);
        assert!(err.to_string().contains("labels"));
        assert_eq!(registry.rejected().count(), 2);
    }

    #[test]
    fn test_unknown_kind_is_unsupported_kind() {
        let registry = Registry::from_yaml_str(REGISTRY).unwrap();
        let err = registry.spec("vision").unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::UnsupportedKind);
    }

    #[test]
    fn test_missing_name_is_not_found() {
        let registry = Registry::from_yaml_str(REGISTRY).unwrap();
        let err = registry.spec("ghost").unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::NotFound);
        assert!(!registry.contains("ghost"));
    }

    #[test]
    fn test_syntax_error_fails_load() {
        let result = Registry::from_yaml_str("models: [unterminated");
        assert!(matches!(result, Err(ConvertError::Config { .. })));
    }

    #[test]
    fn test_output_name_validation() {
        let mut spec = ConversionSpec::new("org/m", ModelKind::Embedding, "../escape");
        assert!(spec.validate("m").is_err());
        spec.output_name = ".hidden".into();
        assert!(spec.validate("m").is_err());
        spec.output_name = "fine-name".into();
        assert!(spec.validate("m").is_ok());
    }

    #[test]
    fn test_from_specs_validates() {
        let mut spec = ConversionSpec::new("org/m", ModelKind::Embedding, "m");
        spec.max_length = 0;
        assert!(Registry::from_specs([("m", spec)]).is_err());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!(
            "Token_Classification".parse::<ModelKind>().unwrap(),
            ModelKind::TokenClassification
        );
        assert!("regression".parse::<ModelKind>().is_err());
    }
}
