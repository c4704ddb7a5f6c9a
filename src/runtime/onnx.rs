/**
 * ONNX backend
 *
 * Runs the M2M100 encoder-decoder export (encoder_model.onnx +
 * decoder_model.onnx, Optimum layout) through ONNX Runtime.
 *
 * Precision picks the file variant:
 * - fp32:      encoder_model.onnx
 * - fp16:      encoder_model_fp16.onnx
 * - quantized: encoder_model_quantized.onnx (or _int8)
 *
 * Note: ort sessions need `&mut self` to run, so each session sits behind a
 * std::sync::Mutex and is only used from the blocking pool.
 */
use std::fmt::{Debug, Display};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, Once};

use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::PrimitiveTensorElementType;
use ort::value::{DynValue, Tensor};

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::runtime::loader::ModelLoader;
use crate::runtime::model::{EncoderState, LoadedRuntime, ModelConfig, Seq2SeqModel};
use crate::runtime::resolve::{Device, NumericPrecision, ResolvedRuntimeParams, StaticCapabilities};
use crate::runtime::tokenizer::M2m100Tokenizer;

static INIT: Once = Once::new();

/// Initialize the ONNX Runtime environment once per process.
pub fn init_onnx() {
    INIT.call_once(|| {
        // true = first-time initialization, false = already initialized
        let is_first = ort::init().with_name("m2m100-local").commit();
        if is_first {
            tracing::info!("ONNX Runtime initialized");
        } else {
            tracing::debug!("ONNX Runtime already initialized");
        }
    });
}

fn ort_err<E: Display>(context: &str) -> impl Fn(E) -> RuntimeError + '_ {
    move |e| RuntimeError::inference(format!("{context}: {e}"))
}

fn load_err<E: Display>(context: &str) -> impl Fn(E) -> RuntimeError + '_ {
    move |e| RuntimeError::load(format!("{context}: {e}"))
}

const QUANTIZED_SUFFIXES: [&str; 2] = ["_quantized", "_int8"];
const FP16_SUFFIXES: [&str; 1] = ["_fp16"];
const FP32_SUFFIXES: [&str; 1] = [""];

/// Encoder and decoder files for one precision variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    pub encoder: PathBuf,
    pub decoder: PathBuf,
}

impl ArtifactSet {
    fn suffixes(params: &ResolvedRuntimeParams) -> &'static [&'static str] {
        if params.quantized {
            &QUANTIZED_SUFFIXES
        } else {
            match params.precision {
                NumericPrecision::Fp16 => &FP16_SUFFIXES,
                NumericPrecision::Fp32 => &FP32_SUFFIXES,
            }
        }
    }

    fn find(model_dir: &Path, stem: &str, suffixes: &[&str]) -> Option<PathBuf> {
        // Optimum exports put the graphs either at the root or under onnx/.
        [model_dir.to_path_buf(), model_dir.join("onnx")]
            .iter()
            .flat_map(|dir| suffixes.iter().map(move |s| dir.join(format!("{stem}{s}.onnx"))))
            .find(|path| path.is_file())
    }

    fn locate_with(model_dir: &Path, suffixes: &[&str]) -> Option<Self> {
        Some(Self {
            encoder: Self::find(model_dir, "encoder_model", suffixes)?,
            decoder: Self::find(model_dir, "decoder_model", suffixes)?,
        })
    }

    /// The files matching the resolved precision. Never substitutes another variant.
    pub fn locate(model_dir: &Path, params: &ResolvedRuntimeParams) -> Result<Self> {
        let suffixes = Self::suffixes(params);
        Self::locate_with(model_dir, suffixes).ok_or_else(|| {
            RuntimeError::load(format!(
                "no encoder_model{0}.onnx / decoder_model{0}.onnx pair in {1}",
                suffixes[0],
                model_dir.display()
            ))
        })
    }

    pub fn quantized_available(model_dir: &Path) -> bool {
        Self::locate_with(model_dir, &QUANTIZED_SUFFIXES).is_some()
    }
}

/// Encoder output passed back into every decoder step.
struct OnnxEncoderOutput {
    hidden_states: DynValue,
}

pub struct OnnxSeq2Seq {
    encoder: Mutex<Session>,
    decoder: Mutex<Session>,
    config: ModelConfig,
}

fn lock_session<'a>(session: &'a Mutex<Session>, name: &str) -> Result<MutexGuard<'a, Session>> {
    session
        .lock()
        .map_err(|e| RuntimeError::inference(format!("{name} session lock poisoned: {e}")))
}

fn build_session(path: &Path, device: Device, intra_threads: usize) -> Result<Session> {
    tracing::info!(path = %path.display(), %device, "creating ONNX session");

    let builder = Session::builder()
        .map_err(load_err("create SessionBuilder"))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(load_err("set optimization level"))?
        .with_intra_threads(intra_threads)
        .map_err(load_err("set intra threads"))?;

    let mut builder = match device {
        Device::Accelerator => builder
            .with_execution_providers([CUDAExecutionProvider::default()
                .build()
                .error_on_failure()])
            .map_err(load_err("register CUDA execution provider"))?,
        Device::Cpu => builder,
    };

    builder
        .commit_from_file(path)
        .map_err(load_err("load ONNX model"))
}

/// Slice the last decoder position out of `[rows, len, vocab]` logits.
fn last_position_logits<T: Copy>(
    shape: &[i64],
    data: &[T],
    rows: usize,
    to_f32: impl Fn(T) -> f32,
) -> Result<Vec<Vec<f32>>> {
    if shape.len() != 3 || shape[0] as usize != rows {
        return Err(RuntimeError::inference(format!(
            "unexpected logits shape {shape:?} for {rows} rows"
        )));
    }
    let len = shape[1] as usize;
    let vocab = shape[2] as usize;
    if len == 0 || data.len() != rows * len * vocab {
        return Err(RuntimeError::inference(format!(
            "logits data length {} does not match shape {shape:?}",
            data.len()
        )));
    }

    Ok((0..rows)
        .map(|row| {
            let start = (row * len + len - 1) * vocab;
            data[start..start + vocab].iter().map(|&v| to_f32(v)).collect()
        })
        .collect())
}

/// `[1, len, hidden]` becomes `[rows, len, hidden]`.
fn tiled_shape(shape: &[i64], rows: usize) -> Result<[usize; 3]> {
    match shape {
        [1, len, hidden] => Ok([rows, *len as usize, *hidden as usize]),
        _ => Err(RuntimeError::inference(format!(
            "unexpected encoder output shape {shape:?}"
        ))),
    }
}

fn tiled_tensor<T>(shape: &[i64], data: &[T], rows: usize) -> Result<DynValue>
where
    T: PrimitiveTensorElementType + Copy + Debug + 'static,
{
    let dims = tiled_shape(shape, rows)?;
    Tensor::<T>::from_array((dims, data.repeat(rows).into_boxed_slice()))
        .map(|tensor| tensor.into_dyn())
        .map_err(ort_err("tile encoder hidden states"))
}

fn tile_hidden_states(hidden: &DynValue, rows: usize) -> Result<DynValue> {
    match hidden.try_extract_tensor::<f32>() {
        Ok((shape, data)) => tiled_tensor(shape, data, rows),
        Err(_) => {
            let (shape, data) = hidden
                .try_extract_tensor::<half::f16>()
                .map_err(ort_err("extract encoder hidden states"))?;
            tiled_tensor(shape, data, rows)
        }
    }
}

impl Seq2SeqModel for OnnxSeq2Seq {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn encode(&self, input_ids: &[i64], batch: usize) -> Result<EncoderState> {
        let seq_len = input_ids.len();
        let ids_tensor = Tensor::<i64>::from_array(([1, seq_len], input_ids.to_vec().into_boxed_slice()))
            .map_err(ort_err("create input_ids tensor"))?;
        let mask_tensor = Tensor::<i64>::from_array(([1, seq_len], vec![1i64; seq_len].into_boxed_slice()))
            .map_err(ort_err("create attention_mask tensor"))?;

        let mut session = lock_session(&self.encoder, "encoder")?;
        let mut outputs = session
            .run(ort::inputs![
                "input_ids" => ids_tensor,
                "attention_mask" => mask_tensor
            ])
            .map_err(ort_err("encoder run"))?;

        let hidden_states = outputs
            .remove("last_hidden_state")
            .ok_or_else(|| RuntimeError::inference("encoder produced no last_hidden_state"))?;
        // Every beam reads the same source, so the single encoder row is copied.
        let hidden_states = if batch > 1 {
            tile_hidden_states(&hidden_states, batch)?
        } else {
            hidden_states
        };

        Ok(EncoderState::new(
            OnnxEncoderOutput { hidden_states },
            batch,
            seq_len,
        ))
    }

    fn next_token_logits(
        &self,
        state: &EncoderState,
        decoder_ids: &[Vec<i64>],
    ) -> Result<Vec<Vec<f32>>> {
        let encoder = state
            .downcast_ref::<OnnxEncoderOutput>()
            .ok_or_else(|| RuntimeError::inference("encoder state from another backend"))?;

        let rows = decoder_ids.len();
        if rows != state.batch() {
            return Err(RuntimeError::inference(format!(
                "decoder batch {rows} does not match encoder batch {}",
                state.batch()
            )));
        }
        let len = decoder_ids.first().map(Vec::len).unwrap_or(0);
        let source_len = state.source_len();

        let ids_tensor = Tensor::<i64>::from_array(([rows, len], decoder_ids.concat().into_boxed_slice()))
            .map_err(ort_err("create decoder input_ids tensor"))?;
        let mask_tensor = Tensor::<i64>::from_array((
            [rows, source_len],
            vec![1i64; rows * source_len].into_boxed_slice(),
        ))
        .map_err(ort_err("create encoder_attention_mask tensor"))?;

        let mut session = lock_session(&self.decoder, "decoder")?;
        let mut outputs = session
            .run(ort::inputs![
                "encoder_attention_mask" => mask_tensor,
                "input_ids" => ids_tensor,
                "encoder_hidden_states" => &encoder.hidden_states
            ])
            .map_err(ort_err("decoder run"))?;

        let logits = outputs
            .remove("logits")
            .ok_or_else(|| RuntimeError::inference("decoder produced no logits"))?;
        match logits.try_extract_tensor::<f32>() {
            Ok((shape, data)) => last_position_logits(shape, data, rows, |v| v),
            Err(_) => {
                // fp16 exports hand back half precision logits.
                let (shape, data) = logits
                    .try_extract_tensor::<half::f16>()
                    .map_err(ort_err("extract logits"))?;
                last_position_logits(shape, data, rows, f32::from)
            }
        }
    }
}

/// Builds [`OnnxSeq2Seq`] + [`M2m100Tokenizer`] from a model directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnnxLoader;

impl OnnxLoader {
    /// Registers the CUDA provider on a throwaway builder. A CUDA build of
    /// onnxruntime on a host without a usable GPU or driver fails here.
    fn accelerator_available() -> bool {
        init_onnx();
        match CUDAExecutionProvider::default().is_available() {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                tracing::debug!("CUDA availability check failed: {e}");
                return false;
            }
        }

        let registered = match Session::builder() {
            Ok(builder) => builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure()])
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match registered {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("CUDA execution provider not usable: {e}");
                false
            }
        }
    }
}

impl ModelLoader for OnnxLoader {
    fn probe(&self, config: &RuntimeConfig) -> StaticCapabilities {
        StaticCapabilities {
            accelerator: Self::accelerator_available(),
            quantization: ArtifactSet::quantized_available(&config.model_path),
        }
    }

    fn load(&self, config: &RuntimeConfig, params: &ResolvedRuntimeParams) -> Result<LoadedRuntime> {
        init_onnx();

        let model_dir = config.model_path.as_path();
        if !model_dir.exists() {
            return Err(RuntimeError::load(format!(
                "model directory does not exist: {}",
                model_dir.display()
            )));
        }

        let model_config = ModelConfig::load(model_dir)?;
        let artifacts = ArtifactSet::locate(model_dir, params)?;
        let tokenizer = M2m100Tokenizer::from_dir(model_dir)?;

        let encoder = build_session(&artifacts.encoder, params.device, config.intra_threads)?;
        tracing::info!("encoder session ready");
        let decoder = build_session(&artifacts.decoder, params.device, config.intra_threads)?;
        tracing::info!("decoder session ready");

        let model = OnnxSeq2Seq {
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
            config: model_config,
        };
        Ok(LoadedRuntime::new(Box::new(model), Box::new(tokenizer), *params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"onnx").unwrap();
    }

    fn params(precision: NumericPrecision, quantized: bool) -> ResolvedRuntimeParams {
        ResolvedRuntimeParams {
            device: Device::Cpu,
            precision,
            quantized,
        }
    }

    #[test]
    fn test_locate_fp32_at_root() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("encoder_model.onnx"));
        touch(&dir.path().join("decoder_model.onnx"));

        let set = ArtifactSet::locate(dir.path(), &params(NumericPrecision::Fp32, false)).unwrap();
        assert_eq!(set.encoder, dir.path().join("encoder_model.onnx"));
        assert_eq!(set.decoder, dir.path().join("decoder_model.onnx"));
    }

    #[test]
    fn test_locate_quantized_under_onnx_subdir() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("onnx/encoder_model_quantized.onnx"));
        touch(&dir.path().join("onnx/decoder_model_quantized.onnx"));

        assert!(ArtifactSet::quantized_available(dir.path()));
        let set = ArtifactSet::locate(dir.path(), &params(NumericPrecision::Fp32, true)).unwrap();
        assert!(set.encoder.ends_with("onnx/encoder_model_quantized.onnx"));
    }

    #[test]
    fn test_locate_does_not_substitute_precision() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("encoder_model.onnx"));
        touch(&dir.path().join("decoder_model.onnx"));

        let err = ArtifactSet::locate(dir.path(), &params(NumericPrecision::Fp16, false)).unwrap_err();
        assert!(matches!(err, RuntimeError::LoadFailure(_)));
        assert!(!ArtifactSet::quantized_available(dir.path()));
    }

    #[test]
    fn test_quantized_needs_both_graphs() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("encoder_model_int8.onnx"));
        assert!(!ArtifactSet::quantized_available(dir.path()));
    }

    #[test]
    fn test_tiled_shape_repeats_single_row() {
        assert_eq!(tiled_shape(&[1, 7, 1024], 4).unwrap(), [4, 7, 1024]);
        assert!(tiled_shape(&[2, 7, 1024], 4).is_err());
        assert!(tiled_shape(&[7, 1024], 4).is_err());
    }

    #[test]
    fn test_last_position_logits_picks_final_step() {
        // rows = 2, len = 2, vocab = 3
        let data: Vec<f32> = vec![
            0.0, 0.0, 0.0, 1.0, 2.0, 3.0, //
            9.0, 9.0, 9.0, 4.0, 5.0, 6.0,
        ];
        let rows = last_position_logits(&[2, 2, 3], &data, 2, |v| v).unwrap();
        assert_eq!(rows, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
    }

    #[test]
    fn test_last_position_logits_rejects_bad_shape() {
        let data = vec![0.0f32; 6];
        assert!(last_position_logits(&[1, 2, 3], &data, 2, |v| v).is_err());
        assert!(last_position_logits(&[2, 3], &data, 2, |v| v).is_err());
    }
}
