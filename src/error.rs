use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the translation runtime.
///
/// Cloneable so a single failed load can be handed to every caller that was
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("model artifacts not found at {}", .0.display())]
    ArtifactMissing(PathBuf),

    #[error("failed to load model runtime: {0}")]
    LoadFailure(String),

    #[error("unsupported language code: {0}")]
    UnsupportedLanguage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RuntimeError {
    pub fn load(msg: impl Into<String>) -> Self {
        Self::LoadFailure(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    /// Stable machine-readable name used by the HTTP layer.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ArtifactMissing(_) => "artifact_missing",
            Self::LoadFailure(_) => "load_failure",
            Self::UnsupportedLanguage(_) => "unsupported_language",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Inference(_) => "inference_error",
            Self::Config(_) => "config_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Failures from the artifact fetcher.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("download of {url} failed with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("integrity check failed: {0}")]
    Integrity(String),
}
