/**
 * Request orchestration: validation, defaults and fan-out to the engine.
 */
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::runtime::loader::RuntimeHandle;
use crate::translation::engine::{self, GenerationJob};

pub const MAX_LENGTH_RANGE: RangeInclusive<usize> = 32..=1024;
pub const BEAM_SIZE_RANGE: RangeInclusive<usize> = 1..=8;

/// Target language code to translated text, one entry per distinct target.
pub type TranslationResult = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub source_text: String,
    pub target_languages: Vec<String>,
    #[serde(default)]
    pub source_language: Option<String>,
    /// Prepended to the source text on its own line.
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub beam_size: Option<usize>,
}

impl TranslationRequest {
    pub fn new(source_text: impl Into<String>, target_languages: &[&str]) -> Self {
        Self {
            source_text: source_text.into(),
            target_languages: target_languages.iter().map(|s| s.to_string()).collect(),
            source_language: None,
            context: None,
            max_length: None,
            beam_size: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_source_language(mut self, code: impl Into<String>) -> Self {
        self.source_language = Some(code.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_text.trim().is_empty() {
            return Err(RuntimeError::InvalidRequest(
                "source_text must not be empty".into(),
            ));
        }
        if self.target_languages.is_empty() {
            return Err(RuntimeError::InvalidRequest(
                "target_languages must contain at least one code".into(),
            ));
        }
        if self.target_languages.iter().any(|code| code.trim().is_empty()) {
            return Err(RuntimeError::InvalidRequest(
                "target_languages must not contain empty codes".into(),
            ));
        }
        if let Some(max_length) = self.max_length {
            if !MAX_LENGTH_RANGE.contains(&max_length) {
                return Err(RuntimeError::InvalidRequest(format!(
                    "max_length must be between {} and {}, got {max_length}",
                    MAX_LENGTH_RANGE.start(),
                    MAX_LENGTH_RANGE.end()
                )));
            }
        }
        if let Some(beam_size) = self.beam_size {
            if !BEAM_SIZE_RANGE.contains(&beam_size) {
                return Err(RuntimeError::InvalidRequest(format!(
                    "beam_size must be between {} and {}, got {beam_size}",
                    BEAM_SIZE_RANGE.start(),
                    BEAM_SIZE_RANGE.end()
                )));
            }
        }
        Ok(())
    }

    /// Source text with the context line in front, both trimmed.
    pub fn effective_text(&self) -> String {
        let text = self.source_text.trim();
        match self.context.as_deref().map(str::trim) {
            Some(context) if !context.is_empty() => format!("{context}\n{text}"),
            _ => text.to_string(),
        }
    }

    /// Requested targets in order, duplicates removed.
    pub fn distinct_targets(&self) -> Vec<String> {
        let mut seen = Vec::with_capacity(self.target_languages.len());
        for code in &self.target_languages {
            if !seen.contains(code) {
                seen.push(code.clone());
            }
        }
        seen
    }
}

/// Body of a successful `/translate` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslateResponse {
    pub translations: TranslationResult,
}

#[derive(Clone)]
pub struct TranslationService {
    handle: RuntimeHandle,
}

impl TranslationService {
    pub fn new(handle: RuntimeHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &RuntimeHandle {
        &self.handle
    }

    /// Translate into every requested language, or fail as a whole.
    pub async fn translate(&self, request: TranslationRequest) -> Result<TranslationResult> {
        request.validate()?;
        let runtime = self.handle.ensure_loaded().await?;
        let config = self.handle.config();

        let text = request.effective_text();
        let source_language = request
            .source_language
            .clone()
            .unwrap_or_else(|| config.source_language.clone());
        let max_length = request.max_length.unwrap_or(config.max_length);
        let beam_size = request.beam_size.unwrap_or(config.beam_size);
        let targets = request.distinct_targets();

        // Check every target up front so one bad code costs no generation.
        if let Some(unknown) = targets
            .iter()
            .find(|code| runtime.tokenizer().language_id(code).is_none())
        {
            return Err(RuntimeError::UnsupportedLanguage(unknown.clone()));
        }

        let mut translations = TranslationResult::new();
        for target in targets {
            let job = GenerationJob {
                text: text.clone(),
                target_language: target.clone(),
                source_language: source_language.clone(),
                max_length,
                beam_size,
            };
            let translated = engine::translate_blocking(runtime.clone(), job).await?;
            translations.insert(target, translated);
        }

        tracing::info!(
            targets = translations.len(),
            source = %source_language,
            "translation request served"
        );
        Ok(translations)
    }

    /// Language codes the loaded model supports, loading it if needed.
    pub async fn supported_languages(&self) -> Result<Vec<String>> {
        let runtime = self.handle.ensure_loaded().await?;
        Ok(runtime.tokenizer().supported_languages())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::test_utils::CountingLoader;

    fn service(languages: &[&str]) -> TranslationService {
        TranslationService::new(RuntimeHandle::new(
            RuntimeConfig::new("/models/fake"),
            CountingLoader::new(languages),
        ))
    }

    #[test]
    fn test_validate_ranges() {
        let mut request = TranslationRequest::new("Hello", &["fr"]);
        assert!(request.validate().is_ok());

        request.max_length = Some(16);
        assert!(matches!(request.validate(), Err(RuntimeError::InvalidRequest(_))));

        request.max_length = Some(1024);
        request.beam_size = Some(9);
        assert!(matches!(request.validate(), Err(RuntimeError::InvalidRequest(_))));
    }

    #[test]
    fn test_blank_text_and_empty_targets_rejected() {
        assert!(TranslationRequest::new("   ", &["fr"]).validate().is_err());
        assert!(TranslationRequest::new("Hello", &[]).validate().is_err());
        assert!(TranslationRequest::new("Hello", &[""]).validate().is_err());
    }

    #[test]
    fn test_effective_text_prefixes_context() {
        let request = TranslationRequest::new("  Hello ", &["fr"]).with_context(" formal tone ");
        assert_eq!(request.effective_text(), "formal tone\nHello");

        let blank = TranslationRequest::new("Hello", &["fr"]).with_context("  ");
        assert_eq!(blank.effective_text(), "Hello");
    }

    #[test]
    fn test_request_defaults_from_json() {
        let request: TranslationRequest =
            serde_json::from_str(r#"{"source_text":"Hi","target_languages":["fr"]}"#).unwrap();
        assert_eq!(request, TranslationRequest::new("Hi", &["fr"]));
    }

    #[tokio::test]
    async fn test_one_entry_per_target() {
        let service = service(&["en", "fr", "de"]);
        let result = service
            .translate(TranslationRequest::new("Hello", &["fr", "de"]))
            .await
            .unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result["fr"], "Hello");
        assert_eq!(result["de"], "Hello");
    }

    #[tokio::test]
    async fn test_duplicate_targets_collapse() {
        let service = service(&["en", "fr"]);
        let result = service
            .translate(TranslationRequest::new("Hello", &["fr", "fr"]))
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_target_fails_whole_request() {
        let service = service(&["en", "fr"]);
        let err = service
            .translate(TranslationRequest::new("Hello", &["fr", "de"]))
            .await
            .unwrap_err();
        assert_eq!(err, RuntimeError::UnsupportedLanguage("de".to_string()));
    }

    #[tokio::test]
    async fn test_context_reaches_engine() {
        let service = service(&["en", "fr"]);
        let result = service
            .translate(TranslationRequest::new("Hello", &["fr"]).with_context("formal tone"))
            .await
            .unwrap();
        assert_eq!(result["fr"], "formal tone\nHello");
    }

    #[tokio::test]
    async fn test_unknown_source_language_override() {
        let service = service(&["en", "fr"]);
        let err = service
            .translate(TranslationRequest::new("Hello", &["fr"]).with_source_language("zz"))
            .await
            .unwrap_err();
        assert_eq!(err, RuntimeError::UnsupportedLanguage("zz".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_request_does_not_load() {
        let loader = std::sync::Arc::new(CountingLoader::new(&["en"]));
        let service = TranslationService::new(RuntimeHandle::new(
            RuntimeConfig::new("/models/fake"),
            loader.clone(),
        ));
        let _ = service.translate(TranslationRequest::new("", &["fr"])).await;
        assert_eq!(loader.loads(), 0);
    }
}
