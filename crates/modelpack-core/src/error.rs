//! Error types for the conversion pipeline.
//!
//! Every pipeline stage has its own variant so the batch orchestrator can
//! report which kind of failure stopped an entry. Nothing here is retried:
//! all failures are assumed deterministic for identical inputs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the conversion pipeline.
#[derive(Debug, Error)]
pub enum ConvertError {
    // Materializer errors
    #[error("Could not resolve source {source_id}: {message}")]
    SourceResolution { source_id: String, message: String },

    #[error("Unsupported model kind {kind}{}", architecture_suffix(.architecture))]
    UnsupportedKind {
        kind: String,
        architecture: Option<String>,
    },

    // Freezer errors
    #[error("Tracing failed: {message}")]
    Tracing { message: String },

    // Lowerer errors
    #[error("Lowering failed at operator {operator} (shape {shape}, dtype {dtype}): {message}")]
    Lowering {
        operator: String,
        shape: String,
        dtype: String,
        message: String,
    },

    // Compressor errors
    #[error("Quantization to {bits} bits failed: {message}")]
    Quantization { bits: u32, message: String },

    // Writer errors
    #[error("Failed to persist {path:?}: {message}")]
    Persistence {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Orchestrator errors
    #[error("Model not found in registry: {name}")]
    NotFound { name: String },

    // Registry errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid registry entry {name}: {message}")]
    InvalidSpec { name: String, message: String },

    // Package runtime errors
    #[error("Runtime error: {message}")]
    Runtime { message: String },

    // Ambient errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

fn architecture_suffix(architecture: &Option<String>) -> String {
    architecture
        .as_deref()
        .map(|a| format!(" for architecture {a}"))
        .unwrap_or_default()
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, ConvertError>;

/// Coarse failure category carried in run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SourceResolution,
    UnsupportedKind,
    Tracing,
    Lowering,
    Quantization,
    Persistence,
    NotFound,
    InvalidSpec,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::SourceResolution => "SourceResolutionError",
            FailureKind::UnsupportedKind => "UnsupportedKindError",
            FailureKind::Tracing => "TracingError",
            FailureKind::Lowering => "LoweringError",
            FailureKind::Quantization => "QuantizationError",
            FailureKind::Persistence => "PersistenceError",
            FailureKind::NotFound => "NotFoundError",
            FailureKind::InvalidSpec => "InvalidSpecError",
            FailureKind::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

// Conversion implementations for common error types

impl From<std::io::Error> for ConvertError {
    fn from(err: std::io::Error) -> Self {
        ConvertError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ConvertError {
    fn from(err: serde_json::Error) -> Self {
        ConvertError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_yaml::Error> for ConvertError {
    fn from(err: serde_yaml::Error) -> Self {
        ConvertError::Config {
            message: err.to_string(),
        }
    }
}

impl From<candle_core::Error> for ConvertError {
    fn from(err: candle_core::Error) -> Self {
        ConvertError::Runtime {
            message: err.to_string(),
        }
    }
}

impl ConvertError {
    /// Create an IO error with path context.
    pub fn io(message: impl Into<String>, path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        ConvertError::Io {
            message: message.into(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a persistence error with path context.
    pub fn persistence(
        message: impl Into<String>,
        path: impl Into<PathBuf>,
        err: std::io::Error,
    ) -> Self {
        ConvertError::Persistence {
            path: path.into(),
            message: format!("{}: {}", message.into(), err),
            source: Some(err),
        }
    }

    pub fn tracing(message: impl Into<String>) -> Self {
        ConvertError::Tracing {
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        ConvertError::Runtime {
            message: message.into(),
        }
    }

    /// Map to the failure category shown in run reports.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ConvertError::SourceResolution { .. } => FailureKind::SourceResolution,
            ConvertError::UnsupportedKind { .. } => FailureKind::UnsupportedKind,
            ConvertError::Tracing { .. } => FailureKind::Tracing,
            ConvertError::Lowering { .. } => FailureKind::Lowering,
            ConvertError::Quantization { .. } => FailureKind::Quantization,
            ConvertError::Persistence { .. } => FailureKind::Persistence,
            ConvertError::NotFound { .. } => FailureKind::NotFound,
            ConvertError::InvalidSpec { .. } | ConvertError::Config { .. } => {
                FailureKind::InvalidSpec
            }
            ConvertError::Runtime { .. } | ConvertError::Io { .. } | ConvertError::Json { .. } => {
                FailureKind::Internal
            }
        }
    }
}
