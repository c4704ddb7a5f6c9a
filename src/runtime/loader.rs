/**
 * Single-flight runtime loading.
 *
 * [`RuntimeHandle`] owns the `Unloaded → Loading → Ready` lifecycle. The
 * first caller to find the runtime unloaded starts one load on the blocking
 * pool; everyone who arrives while it runs waits for that same load. A
 * failed load puts the handle back to `Unloaded` so the next call retries.
 */
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::runtime::model::LoadedRuntime;
use crate::runtime::resolve::{self, Resolution, ResolvedRuntimeParams, StaticCapabilities};

/// Builds the model and tokenizer from on-disk artifacts.
///
/// Both methods block and are only called from the blocking pool.
pub trait ModelLoader: Send + Sync + 'static {
    /// What the host supports for this model directory.
    fn probe(&self, config: &RuntimeConfig) -> StaticCapabilities;

    fn load(&self, config: &RuntimeConfig, params: &ResolvedRuntimeParams) -> Result<LoadedRuntime>;
}

impl<T: ModelLoader> ModelLoader for Arc<T> {
    fn probe(&self, config: &RuntimeConfig) -> StaticCapabilities {
        (**self).probe(config)
    }

    fn load(&self, config: &RuntimeConfig, params: &ResolvedRuntimeParams) -> Result<LoadedRuntime> {
        (**self).load(config, params)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
}

type LoadOutcome = Option<Result<Arc<LoadedRuntime>>>;

enum Slot {
    Unloaded,
    Loading(watch::Receiver<LoadOutcome>),
    Ready(Arc<LoadedRuntime>),
}

struct Inner {
    config: Arc<RuntimeConfig>,
    loader: Arc<dyn ModelLoader>,
    slot: Mutex<Slot>,
    attempts: AtomicUsize,
}

impl Inner {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        // Slot transitions are single assignments; a poisoned guard still holds a valid state.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resolve(&self) -> Resolution {
        self.resolve_with(&self.loader.probe(&self.config))
    }

    fn resolve_with(&self, caps: &StaticCapabilities) -> Resolution {
        resolve::resolve(self.config.device, self.config.precision, caps)
    }

    fn load_with(&self, caps: &StaticCapabilities) -> Result<LoadedRuntime> {
        let resolution = self.resolve_with(caps);
        for warning in &resolution.warnings {
            tracing::warn!("{warning}");
        }
        let params = resolution.params;

        tracing::info!(
            model_id = %self.config.model_id,
            model_path = %self.config.model_path.display(),
            device = %params.device,
            precision = %params.precision_label(),
            "loading model"
        );
        self.loader.load(&self.config, &params)
    }

    fn load_blocking(&self) -> Result<Arc<LoadedRuntime>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let caps = self.loader.probe(&self.config);
        let runtime = match self.load_with(&caps) {
            // A detected accelerator can still fail to host a session (no driver, no memory).
            Err(e) if self.config.device.is_none() && caps.accelerator => {
                tracing::warn!("accelerator load failed, falling back to cpu: {e}");
                let cpu_only = StaticCapabilities {
                    accelerator: false,
                    ..caps
                };
                self.load_with(&cpu_only)?
            }
            other => other?,
        };

        tracing::info!(
            device = %runtime.params().device,
            languages = runtime.tokenizer().supported_languages().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model ready"
        );
        Ok(Arc::new(runtime))
    }
}

/// Process-wide handle to the translation runtime. Cheap to clone.
#[derive(Clone)]
pub struct RuntimeHandle {
    inner: Arc<Inner>,
}

impl RuntimeHandle {
    pub fn new(config: RuntimeConfig, loader: impl ModelLoader) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                loader: Arc::new(loader),
                slot: Mutex::new(Slot::Unloaded),
                attempts: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LoadState {
        match &*self.inner.lock_slot() {
            Slot::Unloaded => LoadState::Unloaded,
            Slot::Loading(_) => LoadState::Loading,
            Slot::Ready(_) => LoadState::Ready,
        }
    }

    /// The loaded runtime, without triggering a load.
    pub fn loaded(&self) -> Option<Arc<LoadedRuntime>> {
        match &*self.inner.lock_slot() {
            Slot::Ready(runtime) => Some(Arc::clone(runtime)),
            _ => None,
        }
    }

    /// Parameters in effect: the loaded ones once ready, else what a load would pick.
    pub fn effective_params(&self) -> ResolvedRuntimeParams {
        match self.loaded() {
            Some(runtime) => *runtime.params(),
            None => self.inner.resolve().params,
        }
    }

    /// Number of constructions started so far, failed ones included.
    pub fn load_attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Return the ready runtime, loading it first if nobody has yet.
    ///
    /// Safe to call from many tasks at once: exactly one construction runs
    /// and every caller gets the same `Arc`. The load itself runs detached,
    /// so dropping this future does not cancel or restart it.
    pub async fn ensure_loaded(&self) -> Result<Arc<LoadedRuntime>> {
        let mut rx = {
            let mut slot = self.inner.lock_slot();
            match &*slot {
                Slot::Ready(runtime) => return Ok(Arc::clone(runtime)),
                Slot::Loading(rx) => rx.clone(),
                Slot::Unloaded => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Slot::Loading(rx.clone());
                    self.spawn_load(tx);
                    rx
                }
            }
        };

        loop {
            let outcome = rx.borrow_and_update().clone();
            if let Some(outcome) = outcome {
                return outcome;
            }
            rx.changed()
                .await
                .map_err(|_| RuntimeError::load("model load task ended without a result"))?;
        }
    }

    fn spawn_load(&self, tx: watch::Sender<LoadOutcome>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let worker = Arc::clone(&inner);
            let result = tokio::task::spawn_blocking(move || worker.load_blocking())
                .await
                .unwrap_or_else(|e| Err(RuntimeError::load(format!("model load panicked: {e}"))));

            {
                let mut slot = inner.lock_slot();
                *slot = match &result {
                    Ok(runtime) => Slot::Ready(Arc::clone(runtime)),
                    Err(e) => {
                        tracing::error!("model load failed: {e}");
                        Slot::Unloaded
                    }
                };
            }
            let _ = tx.send(Some(result));
        });
    }
}
