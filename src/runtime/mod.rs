/**
 * Translation runtime
 *
 * Device/precision resolution, single-flight loading and the model +
 * tokenizer contracts. `onnx` and `tokenizer` are the production backend.
 */
pub mod loader;
pub mod model;
pub mod onnx;
pub mod resolve;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod tokenizer;

pub use loader::{LoadState, ModelLoader, RuntimeHandle};
pub use model::{LanguageTokenizer, LoadedRuntime, Seq2SeqModel, SourceEncoder};
pub use resolve::{Device, NumericPrecision, ResolvedRuntimeParams};

use crate::config::RuntimeConfig;

/// Handle backed by the ONNX encoder/decoder export in `config.model_path`.
pub fn onnx_runtime(config: RuntimeConfig) -> RuntimeHandle {
    RuntimeHandle::new(config, onnx::OnnxLoader)
}
