/**
 * Runtime and server configuration.
 *
 * Values are layered: built-in defaults, then an optional TOML file, then
 * command-line flags. The resulting [`RuntimeConfig`] is immutable and
 * shared behind an `Arc` for the lifetime of the process.
 */
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::paths;

pub const DEFAULT_MODEL_ID: &str = "Xenova/m2m100_418M";
pub const DEFAULT_BEAM_SIZE: usize = 4;
pub const DEFAULT_MAX_LENGTH: usize = 256;
pub const DEFAULT_SOURCE_LANGUAGE: &str = "en";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9600;

/// Device requested by the operator. `None` in [`RuntimeConfig`] means auto-detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Cpu,
    #[serde(alias = "cuda", alias = "gpu")]
    Accelerator,
}

impl FromStr for DevicePreference {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "accelerator" | "cuda" | "gpu" => Ok(Self::Accelerator),
            other => Err(RuntimeError::Config(format!("unknown device: {other}"))),
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// Requested numeric precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Auto,
    #[serde(alias = "float32")]
    Fp32,
    #[serde(alias = "float16")]
    Fp16,
    Int8,
}

impl FromStr for Precision {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "fp32" | "float32" => Ok(Self::Fp32),
            "fp16" | "float16" => Ok(Self::Fp16),
            "int8" => Ok(Self::Int8),
            other => Err(RuntimeError::Config(format!("unknown precision: {other}"))),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
            Self::Int8 => "int8",
        };
        f.write_str(name)
    }
}

/// Everything the runtime needs to load and drive the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeConfig {
    pub model_id: String,
    pub model_path: PathBuf,
    pub device: Option<DevicePreference>,
    pub precision: Precision,
    pub beam_size: usize,
    pub max_length: usize,
    pub preload: bool,
    pub source_language: String,
    /// Threads given to each ONNX session on the CPU.
    pub intra_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            model_path: paths::default_model_path(),
            device: None,
            precision: Precision::Auto,
            beam_size: DEFAULT_BEAM_SIZE,
            max_length: DEFAULT_MAX_LENGTH,
            preload: true,
            source_language: DEFAULT_SOURCE_LANGUAGE.to_string(),
            intra_threads: num_cpus::get().max(1),
        }
    }
}

impl RuntimeConfig {
    /// Start from defaults and point at a model directory.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Self::default()
        }
    }

    /// Apply a layer of optional values on top of this configuration.
    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(model_id) = &overrides.model_id {
            self.model_id = model_id.clone();
        }
        if let Some(model_path) = &overrides.model_path {
            self.model_path = paths::expand_home(model_path);
        }
        if overrides.device.is_some() {
            self.device = overrides.device;
        }
        if let Some(precision) = overrides.precision {
            self.precision = precision;
        }
        if let Some(beam_size) = overrides.beam_size {
            self.beam_size = beam_size;
        }
        if let Some(max_length) = overrides.max_length {
            self.max_length = max_length;
        }
        if let Some(preload) = overrides.preload {
            self.preload = preload;
        }
        if let Some(source_language) = &overrides.source_language {
            self.source_language = source_language.clone();
        }
        if let Some(intra_threads) = overrides.intra_threads {
            self.intra_threads = intra_threads;
        }
        self
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() {
            return Err(RuntimeError::Config("model_id must not be empty".into()));
        }
        if self.beam_size == 0 {
            return Err(RuntimeError::Config("beam_size must be at least 1".into()));
        }
        // Decoder prompt is two tokens, so anything shorter cannot emit text.
        if self.max_length < 3 {
            return Err(RuntimeError::Config("max_length must be at least 3".into()));
        }
        if self.source_language.trim().is_empty() {
            return Err(RuntimeError::Config(
                "source_language must not be empty".into(),
            ));
        }
        if self.intra_threads == 0 {
            return Err(RuntimeError::Config("intra_threads must be at least 1".into()));
        }
        Ok(())
    }

    /// Startup precondition: the model directory has to exist.
    pub fn ensure_artifacts(&self) -> Result<()> {
        if !self.model_path.exists() {
            return Err(RuntimeError::ArtifactMissing(self.model_path.clone()));
        }
        Ok(())
    }
}

/// Optional values from one configuration layer (file or command line).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub model_id: Option<String>,
    pub model_path: Option<PathBuf>,
    pub device: Option<DevicePreference>,
    pub precision: Option<Precision>,
    pub beam_size: Option<usize>,
    pub max_length: Option<usize>,
    pub preload: Option<bool>,
    pub source_language: Option<String>,
    pub intra_threads: Option<usize>,
}

/// Listener settings for the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Layout of the optional TOML configuration file.
///
/// ```toml
/// model_path = "~/.locax/models/m2m100_418M"
/// precision = "int8"
/// beam_size = 4
///
/// [server]
/// port = 9600
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    #[serde(flatten)]
    pub runtime: ConfigOverrides,
    pub server: ServerSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| RuntimeError::Config(format!("invalid config file: {e}")))
    }

    /// Server settings from this file layered over the defaults.
    pub fn server_config(&self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            host: self.server.host.clone().unwrap_or(defaults.host),
            port: self.server.port.unwrap_or(defaults.port),
        }
    }
}
