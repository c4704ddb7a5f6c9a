// Command-line interface
pub mod cli;
// Configuration layers
pub mod config;
// Artifact fetcher, manifest and registry
pub mod downloads;
pub mod error;
// Default on-disk locations
pub mod paths;
// Model loading and the ONNX backend
pub mod runtime;
// HTTP surface
pub mod server;
// Beam search and request orchestration
pub mod translation;

pub use config::{RuntimeConfig, ServerConfig};
pub use error::{FetchError, Result, RuntimeError};
pub use runtime::{onnx_runtime, RuntimeHandle};
pub use translation::{TranslationRequest, TranslationResult, TranslationService};
