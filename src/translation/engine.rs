/**
 * One source text to one target language.
 */
use std::sync::Arc;

use crate::error::{Result, RuntimeError};
use crate::runtime::model::{LoadedRuntime, SourceEncoder};
use crate::translation::beam::{self, BeamConfig, NO_REPEAT_NGRAM_SIZE};

/// Translate `text` from `source_language` into `target_language`.
///
/// Blocking; runs a full beam search. Callers on the async runtime should go
/// through [`translate_blocking`].
pub fn translate(
    runtime: &LoadedRuntime,
    text: &str,
    target_language: &str,
    source_language: &str,
    max_length: usize,
    beam_size: usize,
) -> Result<String> {
    let tokenizer = runtime.tokenizer();
    let model = runtime.model();
    let model_config = model.config();

    let target_id = tokenizer
        .language_id(target_language)
        .ok_or_else(|| RuntimeError::UnsupportedLanguage(target_language.to_string()))?;
    let source = SourceEncoder::new(tokenizer, source_language)?;
    let input_ids = source.encode(text, model_config.max_position_embeddings)?;

    let num_beams = beam_size.max(1);
    let config = BeamConfig {
        num_beams,
        max_length: max_length.min(model_config.max_position_embeddings),
        eos_token_id: model_config.eos_token_id,
        no_repeat_ngram_size: NO_REPEAT_NGRAM_SIZE,
    };
    let prompt = [model_config.decoder_start_token_id, target_id];

    let generated = {
        let _gate = runtime.lock_generation();
        let state = model.encode(&input_ids, num_beams)?;
        beam::beam_search(model, &state, &prompt, &config)?
    };

    tracing::debug!(
        source = source_language,
        target = target_language,
        input_tokens = input_ids.len(),
        output_tokens = generated.len(),
        "generation finished"
    );

    let decoded = tokenizer.decode(&generated)?;
    Ok(decoded.trim().to_string())
}

/// A single generation with owned inputs, ready to move onto the blocking pool.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub text: String,
    pub target_language: String,
    pub source_language: String,
    pub max_length: usize,
    pub beam_size: usize,
}

/// Run [`translate`] on the blocking pool.
pub async fn translate_blocking(runtime: Arc<LoadedRuntime>, job: GenerationJob) -> Result<String> {
    tokio::task::spawn_blocking(move || {
        translate(
            &runtime,
            &job.text,
            &job.target_language,
            &job.source_language,
            job.max_length,
            job.beam_size,
        )
    })
    .await
    .map_err(|e| RuntimeError::inference(format!("generation task failed: {e}")))?
}
