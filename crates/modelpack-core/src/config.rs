//! Centralized configuration for the conversion pipeline.
//!
//! Constant holders for pipeline defaults, on-disk layout and hub access,
//! plus the per-run [`RunOptions`] assembled by the command surface.

use std::path::PathBuf;
use std::time::Duration;

/// Defaults applied while converting a registry entry.
pub struct PipelineConfig;

impl PipelineConfig {
    /// Sequence length used when an entry does not set `max_length`.
    pub const DEFAULT_MAX_LENGTH: usize = 512;
    /// Text tokenized to build the sample input for tracing.
    pub const PROBE_TEXT: &'static str = "sample text";
    /// Name of the token-id input declared on every package.
    pub const INPUT_IDS: &'static str = "input_ids";
    /// Name of the attention-mask input declared on every package.
    pub const ATTENTION_MASK: &'static str = "attention_mask";
    /// Additive bias applied to masked attention positions.
    pub const MASK_BIAS: f64 = -10_000.0;
}

/// Package and cache layout.
pub struct PathsConfig;

impl PathsConfig {
    pub const OUTPUT_DIR_NAME: &'static str = "output";
    pub const REGISTRY_FILE_NAME: &'static str = "models.yaml";
    pub const MANIFEST_FILE: &'static str = "Manifest.json";
    pub const DATA_DIR: &'static str = "Data";
    pub const PROGRAM_FILE: &'static str = "Data/model.program.json";
    pub const WEIGHTS_FILE: &'static str = "Data/weights/weight.bin";
    pub const TOKENIZER_FILE: &'static str = "Data/tokenizer.json";
    pub const STAGING_PREFIX: &'static str = ".";
    pub const STAGING_SUFFIX: &'static str = ".partial";
    /// Previous package while its replacement is renamed into place.
    pub const ASIDE_SUFFIX: &'static str = ".old";
    pub const FALLBACK_SUFFIX: &'static str = "-unquantized";
    pub const CACHE_DIR_NAME: &'static str = "modelpack";
}

/// Hub access configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const HF_HUB_BASE: &'static str = "https://huggingface.co";
    pub const HF_TOKEN_ENV_VAR: &'static str = "HF_TOKEN";
    pub const HF_OFFLINE_ENV_VAR: &'static str = "HF_HUB_OFFLINE";
    pub const DEFAULT_REVISION: &'static str = "main";
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
}

/// Options for one batch run, assembled by the caller.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Root directory that receives one package per converted entry.
    pub output_dir: PathBuf,
    /// Directory holding hub snapshots.
    pub cache_dir: PathBuf,
    /// Never touch the network; only local paths and cached snapshots resolve.
    pub offline: bool,
    /// Load each written package and run the probe text through it.
    pub verify: bool,
    /// Base URL of the model hub.
    pub hub_base_url: String,
    /// Bearer token for gated or private repositories.
    pub hub_token: Option<String>,
}

impl RunOptions {
    /// Build options from an output directory, filling the rest from the environment.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let offline = std::env::var(NetworkConfig::HF_OFFLINE_ENV_VAR)
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let hub_token = std::env::var(NetworkConfig::HF_TOKEN_ENV_VAR)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self {
            output_dir: output_dir.into(),
            cache_dir: default_cache_dir(),
            offline,
            verify: false,
            hub_base_url: NetworkConfig::HF_HUB_BASE.to_string(),
            hub_token,
        }
    }
}

/// Default snapshot cache: `<user cache dir>/modelpack`, or `./.cache/modelpack`.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join(PathsConfig::CACHE_DIR_NAME)
}
