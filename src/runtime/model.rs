/**
 * Contracts for the opaque model and tokenizer handles.
 *
 * The engine only talks to these traits. The ONNX backend implements them
 * for real artifacts; `test_utils` implements them with scripted fakes.
 */
use std::any::Any;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use serde::Deserialize;

use crate::error::{Result, RuntimeError};
use crate::runtime::resolve::ResolvedRuntimeParams;

fn default_decoder_start() -> i64 {
    2
}

fn default_eos() -> i64 {
    2
}

fn default_pad() -> i64 {
    1
}

fn default_max_positions() -> usize {
    1024
}

/// Subset of the model's `config.json` the generation loop depends on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_decoder_start")]
    pub decoder_start_token_id: i64,
    #[serde(default = "default_eos")]
    pub eos_token_id: i64,
    #[serde(default = "default_pad")]
    pub pad_token_id: i64,
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default = "default_max_positions")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub model_type: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            decoder_start_token_id: default_decoder_start(),
            eos_token_id: default_eos(),
            pad_token_id: default_pad(),
            vocab_size: None,
            max_position_embeddings: default_max_positions(),
            model_type: None,
        }
    }
}

impl ModelConfig {
    /// Read `config.json` from a model directory; M2M100 defaults when absent.
    pub fn load(model_dir: &Path) -> Result<Self> {
        let config_path = model_dir.join("config.json");
        if !config_path.exists() {
            tracing::debug!("no config.json in {}, using M2M100 defaults", model_dir.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&config_path)
            .map_err(|e| RuntimeError::load(format!("cannot read {}: {e}", config_path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| RuntimeError::load(format!("invalid {}: {e}", config_path.display())))?;

        tracing::info!(
            model_type = config.model_type.as_deref().unwrap_or("unknown"),
            decoder_start_token_id = config.decoder_start_token_id,
            eos_token_id = config.eos_token_id,
            max_position_embeddings = config.max_position_embeddings,
            "model config loaded"
        );
        Ok(config)
    }
}

/// Encoder output kept alive for the duration of one generation.
///
/// The payload is backend specific; the engine only passes it back.
pub struct EncoderState {
    inner: Box<dyn Any + Send + Sync>,
    batch: usize,
    source_len: usize,
}

impl EncoderState {
    pub fn new<T: Any + Send + Sync>(inner: T, batch: usize, source_len: usize) -> Self {
        Self {
            inner: Box::new(inner),
            batch,
            source_len,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Rows the encoder output was replicated to.
    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn source_len(&self) -> usize {
        self.source_len
    }
}

/// An encoder-decoder translation model.
pub trait Seq2SeqModel: Send + Sync {
    fn config(&self) -> &ModelConfig;

    /// Encode one source sequence, replicated to `batch` rows.
    fn encode(&self, input_ids: &[i64], batch: usize) -> Result<EncoderState>;

    /// Logits for the next token of every decoder row.
    ///
    /// `decoder_ids` holds exactly `state.batch()` rows of equal length; the
    /// result has one vocabulary-sized vector per row.
    fn next_token_logits(
        &self,
        state: &EncoderState,
        decoder_ids: &[Vec<i64>],
    ) -> Result<Vec<Vec<f32>>>;
}

/// A multilingual subword tokenizer with per-language marker tokens.
pub trait LanguageTokenizer: Send + Sync {
    /// Id of the language marker token for `code`, if the model knows it.
    fn language_id(&self, code: &str) -> Option<i64>;

    /// Sorted language codes the model supports.
    fn supported_languages(&self) -> Vec<String>;

    /// Subword ids for `text` without any special tokens.
    fn encode(&self, text: &str) -> Result<Vec<i64>>;

    /// Text for `ids` with special and language tokens removed.
    fn decode(&self, ids: &[i64]) -> Result<String>;

    fn eos_id(&self) -> i64;
}

/// A tokenizer switched into a source language for a single call.
///
/// Replaces mutating shared tokenizer state, so concurrent requests with
/// different source languages never observe each other.
pub struct SourceEncoder<'a> {
    tokenizer: &'a dyn LanguageTokenizer,
    language_id: i64,
}

impl<'a> SourceEncoder<'a> {
    pub fn new(tokenizer: &'a dyn LanguageTokenizer, source_language: &str) -> Result<Self> {
        let language_id = tokenizer
            .language_id(source_language)
            .ok_or_else(|| RuntimeError::UnsupportedLanguage(source_language.to_string()))?;
        Ok(Self {
            tokenizer,
            language_id,
        })
    }

    /// `[__src__] subwords [</s>]`, truncated to fit `max_positions`.
    pub fn encode(&self, text: &str, max_positions: usize) -> Result<Vec<i64>> {
        let mut subwords = self.tokenizer.encode(text)?;
        let limit = max_positions.saturating_sub(2);
        if subwords.len() > limit {
            tracing::warn!(
                tokens = subwords.len(),
                limit,
                "source text truncated to the model's position limit"
            );
            subwords.truncate(limit);
        }

        let mut ids = Vec::with_capacity(subwords.len() + 2);
        ids.push(self.language_id);
        ids.extend(subwords);
        ids.push(self.tokenizer.eos_id());
        Ok(ids)
    }
}

/// The ready state: model and tokenizer always exist together.
pub struct LoadedRuntime {
    model: Box<dyn Seq2SeqModel>,
    tokenizer: Box<dyn LanguageTokenizer>,
    params: ResolvedRuntimeParams,
    generation_gate: Mutex<()>,
}

impl LoadedRuntime {
    pub fn new(
        model: Box<dyn Seq2SeqModel>,
        tokenizer: Box<dyn LanguageTokenizer>,
        params: ResolvedRuntimeParams,
    ) -> Self {
        Self {
            model,
            tokenizer,
            params,
            generation_gate: Mutex::new(()),
        }
    }

    pub fn model(&self) -> &dyn Seq2SeqModel {
        self.model.as_ref()
    }

    pub fn tokenizer(&self) -> &dyn LanguageTokenizer {
        self.tokenizer.as_ref()
    }

    pub fn params(&self) -> &ResolvedRuntimeParams {
        &self.params
    }

    /// Serialises generations: ONNX sessions need exclusive access.
    pub fn lock_generation(&self) -> MutexGuard<'_, ()> {
        // The guarded value is `()`, so a poisoned lock carries no broken state.
        self.generation_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
