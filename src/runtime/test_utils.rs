/**
 * Runtime test utilities
 *
 * Scripted stand-ins for the model, tokenizer and loader so the loader,
 * engine and service can be exercised without ONNX artifacts.
 */
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::runtime::loader::ModelLoader;
use crate::runtime::model::{
    EncoderState, LanguageTokenizer, LoadedRuntime, ModelConfig, Seq2SeqModel,
};
use crate::runtime::resolve::{Device, ResolvedRuntimeParams, StaticCapabilities};

pub const FAKE_VOCAB_SIZE: usize = 512;
const SPECIAL_TOKENS: [&str; 4] = ["<s>", "<pad>", "</s>", "<unk>"];

/// Whitespace tokenizer that grows its vocabulary on demand.
///
/// Newlines are kept as their own token so decoded text round-trips the
/// `context\ntext` layout.
pub struct VocabTokenizer {
    languages: HashMap<String, i64>,
    words: Mutex<Vec<String>>,
}

impl VocabTokenizer {
    pub fn new(languages: &[&str]) -> Self {
        let mut words: Vec<String> = SPECIAL_TOKENS.iter().map(|s| s.to_string()).collect();
        let mut language_ids = HashMap::new();
        for code in languages {
            language_ids.insert(code.to_string(), words.len() as i64);
            words.push(format!("__{code}__"));
        }
        Self {
            languages: language_ids,
            words: Mutex::new(words),
        }
    }

    fn is_special(&self, id: i64) -> bool {
        (id as usize) < SPECIAL_TOKENS.len() || self.languages.values().any(|&lang| lang == id)
    }

    fn id_for(&self, word: &str) -> i64 {
        let mut words = self.words.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(pos) = words.iter().position(|w| w == word) {
            return pos as i64;
        }
        words.push(word.to_string());
        assert!(words.len() <= FAKE_VOCAB_SIZE, "fake vocabulary exhausted");
        (words.len() - 1) as i64
    }
}

impl LanguageTokenizer for VocabTokenizer {
    fn language_id(&self, code: &str) -> Option<i64> {
        self.languages.get(code).copied()
    }

    fn supported_languages(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.languages.keys().cloned().collect();
        codes.sort();
        codes
    }

    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let mut ids = Vec::new();
        for (i, line) in text.split('\n').enumerate() {
            if i > 0 {
                ids.push(self.id_for("\n"));
            }
            ids.extend(line.split_whitespace().map(|word| self.id_for(word)));
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[i64]) -> Result<String> {
        let words = self.words.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out = String::new();
        for &id in ids {
            if self.is_special(id) {
                continue;
            }
            let word = words
                .get(id as usize)
                .ok_or_else(|| RuntimeError::inference(format!("unknown token id {id}")))?;
            if word == "\n" {
                out.push('\n');
            } else {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push(' ');
                }
                out.push_str(word);
            }
        }
        Ok(out)
    }

    fn eos_id(&self) -> i64 {
        2
    }
}

/// Model that copies the source subwords to the output, then stops.
///
/// Every encoder input is recorded so tests can inspect what the engine fed it.
#[derive(Default)]
pub struct EchoModel {
    config: ModelConfig,
    encoded: Mutex<Vec<Vec<i64>>>,
}

impl EchoModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encoded_inputs(&self) -> Vec<Vec<i64>> {
        self.encoded.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

impl Seq2SeqModel for EchoModel {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn encode(&self, input_ids: &[i64], batch: usize) -> Result<EncoderState> {
        self.encoded.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(input_ids.to_vec());
        Ok(EncoderState::new(input_ids.to_vec(), batch, input_ids.len()))
    }

    fn next_token_logits(
        &self,
        state: &EncoderState,
        decoder_ids: &[Vec<i64>],
    ) -> Result<Vec<Vec<f32>>> {
        let source = state
            .downcast_ref::<Vec<i64>>()
            .ok_or_else(|| RuntimeError::inference("foreign encoder state"))?;
        // Strip the language marker and </s>.
        let body = &source[1..source.len().saturating_sub(1).max(1)];

        Ok(decoder_ids
            .iter()
            .map(|row| {
                let generated = row.len().saturating_sub(2);
                let eos = self.config.eos_token_id;
                let next = body.get(generated).copied().unwrap_or(eos);
                let mut logits = vec![-10.0; FAKE_VOCAB_SIZE];
                // Keep </s> below the other losers so it only wins when chosen.
                logits[eos as usize] = -20.0;
                logits[next as usize] = 10.0;
                logits
            })
            .collect())
    }
}

/// Lets a test keep a handle on a model it moved into a [`LoadedRuntime`].
impl<T: Seq2SeqModel> Seq2SeqModel for Arc<T> {
    fn config(&self) -> &ModelConfig {
        (**self).config()
    }

    fn encode(&self, input_ids: &[i64], batch: usize) -> Result<EncoderState> {
        (**self).encode(input_ids, batch)
    }

    fn next_token_logits(
        &self,
        state: &EncoderState,
        decoder_ids: &[Vec<i64>],
    ) -> Result<Vec<Vec<f32>>> {
        (**self).next_token_logits(state, decoder_ids)
    }
}

/// Model whose logits come from a closure over the decoder row.
pub struct ClosureModel<F> {
    config: ModelConfig,
    logits: F,
}

impl<F> ClosureModel<F>
where
    F: Fn(&[i64]) -> Vec<f32> + Send + Sync,
{
    pub fn new(logits: F) -> Self {
        Self {
            config: ModelConfig::default(),
            logits,
        }
    }
}

impl<F> Seq2SeqModel for ClosureModel<F>
where
    F: Fn(&[i64]) -> Vec<f32> + Send + Sync,
{
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn encode(&self, input_ids: &[i64], batch: usize) -> Result<EncoderState> {
        Ok(EncoderState::new((), batch, input_ids.len()))
    }

    fn next_token_logits(
        &self,
        _state: &EncoderState,
        decoder_ids: &[Vec<i64>],
    ) -> Result<Vec<Vec<f32>>> {
        Ok(decoder_ids.iter().map(|row| (self.logits)(row)).collect())
    }
}

pub fn cpu_params() -> ResolvedRuntimeParams {
    ResolvedRuntimeParams {
        device: Device::Cpu,
        precision: crate::runtime::resolve::NumericPrecision::Fp32,
        quantized: false,
    }
}

/// Ready runtime built from the echo model and a tokenizer for `languages`.
pub fn echo_runtime(languages: &[&str]) -> LoadedRuntime {
    LoadedRuntime::new(
        Box::new(EchoModel::new()),
        Box::new(VocabTokenizer::new(languages)),
        cpu_params(),
    )
}

/// Loader that counts constructions and can be told to fail.
pub struct CountingLoader {
    loads: AtomicUsize,
    failures_left: AtomicUsize,
    delay: Duration,
    languages: Vec<String>,
    accelerator: bool,
    accelerator_usable: bool,
}

impl CountingLoader {
    pub fn new(languages: &[&str]) -> Self {
        Self {
            loads: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            delay: Duration::from_millis(0),
            languages: languages.iter().map(|s| s.to_string()).collect(),
            accelerator: false,
            accelerator_usable: true,
        }
    }

    /// Report an accelerator from `probe`.
    pub fn with_accelerator(mut self) -> Self {
        self.accelerator = true;
        self
    }

    /// Fail every construction that targets the accelerator.
    pub fn accelerator_unusable(mut self) -> Self {
        self.accelerator_usable = false;
        self
    }

    /// Sleep this long inside every construction.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `count` constructions.
    pub fn failing(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for CountingLoader {
    fn probe(&self, _config: &RuntimeConfig) -> StaticCapabilities {
        StaticCapabilities {
            accelerator: self.accelerator,
            quantization: false,
        }
    }

    fn load(&self, _config: &RuntimeConfig, params: &ResolvedRuntimeParams) -> Result<LoadedRuntime> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);

        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(RuntimeError::load("tokenizer.json not found"));
        }
        if params.device == Device::Accelerator && !self.accelerator_usable {
            return Err(RuntimeError::load("register CUDA execution provider: no CUDA device"));
        }

        let languages: Vec<&str> = self.languages.iter().map(String::as_str).collect();
        Ok(LoadedRuntime::new(
            Box::new(EchoModel::new()),
            Box::new(VocabTokenizer::new(&languages)),
            *params,
        ))
    }
}
