/**
 * Translation
 *
 * beam.rs     beam search with no-repeat n-gram blocking
 * engine.rs   one text into one target language
 * service.rs  request validation and fan-out over target languages
 */
pub mod beam;
pub mod engine;
pub mod service;

pub use service::{TranslateResponse, TranslationRequest, TranslationResult, TranslationService};
