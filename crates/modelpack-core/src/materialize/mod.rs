//! Model materialization: resolve a source, load its configuration,
//! tokenizer and weights, and pick the encoder implementation.

pub mod hub;

use std::path::{Path, PathBuf};

use tokenizers::decoders::wordpiece::WordPiece as WordPieceDecoder;
use tokenizers::models::wordpiece::WordPiece;
use tokenizers::normalizers::bert::BertNormalizer;
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::processors::bert::BertProcessing;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::config::RunOptions;
use crate::error::{ConvertError, Result};
use crate::model::{build_module, ArchitectureConfig, EncoderModel, WeightStore};
use crate::registry::ConversionSpec;

use hub::{HubClient, RepoRef, CONFIG_FILE, PICKLE_FILE, TOKENIZER_CONFIG_FILE, TOKENIZER_FILE, VOCAB_FILE};

const UNK_TOKEN: &str = "[UNK]";
const CLS_TOKEN: &str = "[CLS]";
const SEP_TOKEN: &str = "[SEP]";

/// Tokenizer paired with a model.
///
/// Padding and truncation are always controlled by the package's
/// `max_length`, so any settings stored with the tokenizer are dropped
/// before it is used or bundled.
pub struct Preprocessor {
    tokenizer: Tokenizer,
    json: String,
}

impl Preprocessor {
    pub fn from_json_str(json: &str, source_id: &str) -> Result<Self> {
        let tokenizer = Tokenizer::from_bytes(json.as_bytes())
            .map_err(|e| unresolved(source_id, format!("invalid {TOKENIZER_FILE}: {e}")))?;
        Self::from_tokenizer(tokenizer, source_id)
    }

    pub fn from_file(path: &Path, source_id: &str) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| unresolved(source_id, format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&json, source_id)
    }

    /// BERT-style WordPiece tokenizer built from a bare `vocab.txt`.
    pub fn from_wordpiece_vocab(path: &Path, lowercase: bool, source_id: &str) -> Result<Self> {
        let vocab = path
            .to_str()
            .ok_or_else(|| unresolved(source_id, format!("non UTF-8 path {}", path.display())))?;
        let model = WordPiece::from_file(vocab)
            .unk_token(UNK_TOKEN.to_string())
            .build()
            .map_err(|e| unresolved(source_id, format!("invalid {VOCAB_FILE}: {e}")))?;

        let mut tokenizer = Tokenizer::new(model);
        let special = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| unresolved(source_id, format!("{VOCAB_FILE} has no {token} token")))
        };
        let cls = special(CLS_TOKEN)?;
        let sep = special(SEP_TOKEN)?;

        tokenizer
            .with_normalizer(Some(BertNormalizer::new(true, true, None, lowercase)))
            .map_err(|e| unresolved(source_id, format!("cannot set normalizer: {e}")))?
            .with_pre_tokenizer(Some(BertPreTokenizer))
            .with_post_processor(Some(BertProcessing::new(
                (SEP_TOKEN.to_string(), sep),
                (CLS_TOKEN.to_string(), cls),
            )))
            .with_decoder(Some(WordPieceDecoder::default()));
        Self::from_tokenizer(tokenizer, source_id)
    }

    fn from_tokenizer(mut tokenizer: Tokenizer, source_id: &str) -> Result<Self> {
        tokenizer.with_padding(None);
        tokenizer
            .with_truncation(None)
            .map_err(|e| unresolved(source_id, format!("cannot reset truncation: {e}")))?;
        let json = tokenizer
            .to_string(false)
            .map_err(|e| unresolved(source_id, format!("cannot serialize tokenizer: {e}")))?;
        Ok(Self { tokenizer, json })
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// The serialized tokenizer, bundled into packages.
    pub fn json(&self) -> &str {
        &self.json
    }

    /// Token ids including special tokens.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self.encoding(text)?.get_ids().to_vec())
    }

    /// Ids and mask truncated and right-padded to exactly `max_length`.
    pub fn encode_fixed(&self, text: &str, max_length: usize, pad_id: u32) -> Result<(Vec<i32>, Vec<i32>)> {
        let encoding = self.encoding(text)?;
        let real = encoding.get_ids().len().min(max_length);

        let mut ids = encoding.get_ids()[..real]
            .iter()
            .map(|&id| {
                i32::try_from(id)
                    .map_err(|_| ConvertError::tracing(format!("token id {id} exceeds int32")))
            })
            .collect::<Result<Vec<_>>>()?;
        let pad = i32::try_from(pad_id)
            .map_err(|_| ConvertError::tracing(format!("pad id {pad_id} exceeds int32")))?;
        ids.resize(max_length, pad);

        let mut mask: Vec<i32> = encoding.get_attention_mask()[..real]
            .iter()
            .map(|&m| i32::from(m != 0))
            .collect();
        mask.resize(max_length, 0);
        Ok((ids, mask))
    }

    fn encoding(&self, text: &str) -> Result<tokenizers::Encoding> {
        self.tokenizer
            .encode(text, true)
            .map_err(|e| ConvertError::tracing(format!("tokenization failed: {e}")))
    }
}

fn unresolved(source_id: &str, message: String) -> ConvertError {
    ConvertError::SourceResolution {
        source_id: source_id.to_string(),
        message,
    }
}

/// `do_lower_case` from `tokenizer_config.json`; BERT vocabularies default to lowercase.
fn wordpiece_lowercase(dir: &Path) -> bool {
    std::fs::read_to_string(dir.join(TOKENIZER_CONFIG_FILE))
        .ok()
        .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
        .and_then(|config| config.get("do_lower_case").and_then(|v| v.as_bool()))
        .unwrap_or(true)
}

/// `tokenizer.json` when present, else a WordPiece tokenizer from `vocab.txt`.
pub fn load_preprocessor(dir: &Path, source_id: &str) -> Result<Preprocessor> {
    let tokenizer_path = dir.join(TOKENIZER_FILE);
    if tokenizer_path.is_file() {
        return Preprocessor::from_file(&tokenizer_path, source_id);
    }
    let vocab_path = dir.join(VOCAB_FILE);
    if vocab_path.is_file() {
        debug!("No {} for {}, building WordPiece from {}", TOKENIZER_FILE, source_id, VOCAB_FILE);
        return Preprocessor::from_wordpiece_vocab(&vocab_path, wordpiece_lowercase(dir), source_id);
    }
    Err(unresolved(
        source_id,
        format!("neither {TOKENIZER_FILE} nor {VOCAB_FILE} found"),
    ))
}

/// A model ready for tracing, with everything loaded from one source.
pub struct MaterializedModel {
    pub source_id: String,
    pub source_dir: PathBuf,
    pub config: ArchitectureConfig,
    pub module: Box<dyn EncoderModel>,
    pub weights: WeightStore,
    pub preprocessor: Preprocessor,
}

impl std::fmt::Debug for MaterializedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterializedModel")
            .field("source_id", &self.source_id)
            .field("source_dir", &self.source_dir)
            .field("model_type", &self.config.model_type)
            .field("weights", &self.weights.len())
            .finish()
    }
}

/// Resolves registry sources into [`MaterializedModel`]s.
pub struct ModelMaterializer {
    hub: HubClient,
}

impl ModelMaterializer {
    pub fn new(options: &RunOptions) -> Result<Self> {
        Ok(Self {
            hub: HubClient::new(options)?,
        })
    }

    pub async fn materialize(&self, spec: &ConversionSpec) -> Result<MaterializedModel> {
        let dir = self.resolve_source(&spec.source).await?;
        load_dir(&dir, &spec.source, spec)
    }

    /// A local directory, or a hub snapshot (cached or downloaded).
    pub async fn resolve_source(&self, source: &str) -> Result<PathBuf> {
        let local = Path::new(source);
        if local.is_dir() {
            debug!("Using local source {}", local.display());
            return Ok(local.to_path_buf());
        }
        let repo = RepoRef::parse(source).ok_or_else(|| ConvertError::SourceResolution {
            source_id: source.to_string(),
            message: "neither a local directory nor a hub repository id".to_string(),
        })?;
        self.hub.snapshot(&repo).await
    }
}

/// Load a model from a resolved directory.
pub fn load_dir(dir: &Path, source_id: &str, spec: &ConversionSpec) -> Result<MaterializedModel> {
    let config = ArchitectureConfig::load(&dir.join(CONFIG_FILE), source_id)?;
    if config.requires_remote_code() && !spec.trust_remote_code {
        return Err(unresolved(
            source_id,
            "checkpoint requires custom code; set trust_remote_code to allow it".to_string(),
        ));
    }

    let preprocessor = load_preprocessor(dir, source_id)?;
    if preprocessor.vocab_size() > config.vocab_size {
        return Err(unresolved(
            source_id,
            format!(
                "tokenizer vocabulary ({}) is larger than the model's ({})",
                preprocessor.vocab_size(),
                config.vocab_size
            ),
        ));
    }

    let weights = match WeightStore::load_dir(dir, source_id) {
        Err(_) if dir.join(PICKLE_FILE).is_file() => {
            return Err(unresolved(
                source_id,
                "only pickle weights are available; safetensors weights are required".to_string(),
            ))
        }
        other => other?,
    };
    let module = build_module(spec.kind, &config, &weights)?;

    info!(
        "Materialized {} ({}, {} tensors)",
        source_id,
        config.model_type,
        weights.len()
    );
    Ok(MaterializedModel {
        source_id: source_id.to_string(),
        source_dir: dir.to_path_buf(),
        config,
        module,
        weights,
        preprocessor,
    })
}
