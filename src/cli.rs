use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::config::{
    ConfigOverrides, DevicePreference, FileConfig, Precision, RuntimeConfig, ServerConfig,
    DEFAULT_MODEL_ID,
};
use crate::downloads::fetch::{FetchOptions, DEFAULT_ENDPOINT, DEFAULT_MAX_WORKERS, DEFAULT_REVISION};
use crate::paths;

#[derive(Parser, Debug)]
#[command(author, version, about = "Offline M2M100 translation runtime", long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load the model and serve translation requests over HTTP
    Serve(ServeArgs),

    /// Download model artifacts and record them in the local registry
    Fetch(FetchArgs),

    /// Re-hash a model directory against its manifest-lock.json
    Verify {
        /// Model directory (defaults to ~/.locax/models/m2m100_418M)
        #[arg(long)]
        model_path: Option<PathBuf>,
    },
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Directory holding the ONNX export, tokenizer.json and config.json
    #[arg(long)]
    pub model_path: Option<PathBuf>,

    /// Model identifier reported by /metadata
    #[arg(long)]
    pub model_id: Option<String>,

    /// cpu or accelerator (alias: cuda); auto-detected when omitted
    #[arg(long)]
    pub device: Option<DevicePreference>,

    /// auto, fp32, fp16 or int8
    #[arg(long)]
    pub precision: Option<Precision>,

    #[arg(long)]
    pub beam_size: Option<usize>,

    #[arg(long)]
    pub max_length: Option<usize>,

    /// Default source language code
    #[arg(long)]
    pub source_language: Option<String>,

    /// Threads per ONNX session
    #[arg(long)]
    pub intra_threads: Option<usize>,

    /// Load the model on the first request instead of at startup
    #[arg(long)]
    pub no_preload: bool,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,
}

impl ServeArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            model_id: self.model_id.clone(),
            model_path: self.model_path.clone(),
            device: self.device,
            precision: self.precision,
            beam_size: self.beam_size,
            max_length: self.max_length,
            preload: self.no_preload.then_some(false),
            source_language: self.source_language.clone(),
            intra_threads: self.intra_threads,
        }
    }

    /// Defaults, then the config file, then these flags.
    pub fn into_configs(self, file: Option<&FileConfig>) -> (RuntimeConfig, ServerConfig) {
        let mut runtime = RuntimeConfig::default();
        let mut server = ServerConfig::default();
        if let Some(file) = file {
            runtime = runtime.with_overrides(&file.runtime);
            server = file.server_config();
        }

        let runtime = runtime.with_overrides(&self.overrides());
        if let Some(host) = self.host {
            server.host = host;
        }
        if let Some(port) = self.port {
            server.port = port;
        }
        (runtime, server)
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct FetchArgs {
    /// Hugging Face repository ID
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    /// Git revision or tag to download
    #[arg(long, default_value = DEFAULT_REVISION)]
    pub revision: String,

    /// Destination folder (default: ~/.locax/models/m2m100_418M)
    #[arg(long)]
    pub target_dir: Option<PathBuf>,

    /// Recorded precision preference; the runtime picks files at load time
    #[arg(long, default_value = "float16", value_parser = ["float16", "float32", "int8"])]
    pub precision: String,

    /// Optional Hugging Face token
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Remove existing files in the target directory before downloading
    #[arg(long)]
    pub clean: bool,

    /// Max concurrent downloads
    #[arg(long, default_value_t = DEFAULT_MAX_WORKERS)]
    pub max_workers: usize,

    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Registry file (default: ~/.locax/models/registry.json)
    #[arg(long)]
    pub registry: Option<PathBuf>,
}

impl FetchArgs {
    pub fn into_options(self) -> FetchOptions {
        FetchOptions {
            model_id: self.model_id,
            revision: self.revision,
            target_dir: self
                .target_dir
                .unwrap_or_else(paths::default_model_path),
            precision: self.precision,
            token: self.token,
            clean: self.clean,
            max_workers: self.max_workers,
            endpoint: self.endpoint,
            registry_path: self
                .registry
                .unwrap_or_else(paths::default_registry_path),
        }
    }
}
