/**
 * M2M100 tokenizer on top of `tokenizers`.
 *
 * Languages are discovered from the vocabulary: every `__xx__` token is a
 * language marker. Special tokens are added by the engine, never by the
 * tokenizer's own post-processor.
 */
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use tokenizers::Tokenizer;

use crate::error::{Result, RuntimeError};
use crate::runtime::model::LanguageTokenizer;

const SPECIAL_TOKENS: [&str; 4] = ["<s>", "<pad>", "</s>", "<unk>"];
const DEFAULT_EOS_ID: i64 = 2;

pub struct M2m100Tokenizer {
    inner: Tokenizer,
    languages: BTreeMap<String, i64>,
    special_ids: HashSet<u32>,
    eos_id: i64,
}

/// `__fr__` → `fr`; anything else is not a language marker.
fn language_code(token: &str) -> Option<&str> {
    let code = token.strip_prefix("__")?.strip_suffix("__")?;
    let valid = (2..=3).contains(&code.len()) && code.chars().all(|c| c.is_ascii_lowercase());
    valid.then_some(code)
}

impl M2m100Tokenizer {
    /// Load `tokenizer.json` from a model directory.
    pub fn from_dir(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join("tokenizer.json");
        if !path.exists() {
            return Err(RuntimeError::load(format!(
                "tokenizer.json not found in {}",
                model_dir.display()
            )));
        }
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| RuntimeError::load(format!("failed to load tokenizer {}: {e}", path.display())))?;
        Self::from_tokenizer(inner)
    }

    pub fn from_tokenizer(inner: Tokenizer) -> Result<Self> {
        let mut languages = BTreeMap::new();
        for (token, id) in inner.get_vocab(true) {
            if let Some(code) = language_code(&token) {
                languages.insert(code.to_string(), id as i64);
            }
        }
        if languages.is_empty() {
            return Err(RuntimeError::load(
                "tokenizer has no __xx__ language tokens; not an M2M100 tokenizer",
            ));
        }

        let mut special_ids: HashSet<u32> = languages.values().map(|&id| id as u32).collect();
        special_ids.extend(SPECIAL_TOKENS.iter().filter_map(|t| inner.token_to_id(t)));
        special_ids.extend(
            inner
                .get_added_tokens_decoder()
                .into_iter()
                .filter(|(_, token)| token.special)
                .map(|(id, _)| id),
        );

        let eos_id = inner
            .token_to_id("</s>")
            .map(|id| id as i64)
            .unwrap_or(DEFAULT_EOS_ID);

        Ok(Self {
            inner,
            languages,
            special_ids,
            eos_id,
        })
    }
}

impl LanguageTokenizer for M2m100Tokenizer {
    fn language_id(&self, code: &str) -> Option<i64> {
        self.languages.get(code).copied()
    }

    fn supported_languages(&self) -> Vec<String> {
        self.languages.keys().cloned().collect()
    }

    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| RuntimeError::inference(format!("tokenization failed: {e}")))?;
        Ok(encoding.get_ids().iter().map(|&id| id as i64).collect())
    }

    fn decode(&self, ids: &[i64]) -> Result<String> {
        let ids: Vec<u32> = ids
            .iter()
            .filter_map(|&id| u32::try_from(id).ok())
            .filter(|id| !self.special_ids.contains(id))
            .collect();
        self.inner
            .decode(&ids, true)
            .map_err(|e| RuntimeError::inference(format!("detokenization failed: {e}")))
    }

    fn eos_id(&self) -> i64 {
        self.eos_id
    }
}
