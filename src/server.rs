/**
 * HTTP surface
 *
 * GET  /health      {"status": "ready" | "initializing"}
 * GET  /metadata    model id, device, precision and generation defaults
 * GET  /languages   supported language codes once the model is loaded
 * POST /translate   {"translations": {code: text}}
 */
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::RuntimeError;
use crate::runtime::loader::{LoadState, RuntimeHandle};
use crate::translation::{TranslateResponse, TranslationRequest, TranslationService};

#[derive(Clone)]
pub struct AppState {
    pub service: TranslationService,
}

impl AppState {
    pub fn new(handle: RuntimeHandle) -> Self {
        Self {
            service: TranslationService::new(handle),
        }
    }

    fn handle(&self) -> &RuntimeHandle {
        self.service.handle()
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataResponse {
    pub model_id: String,
    pub device: String,
    pub precision: String,
    pub max_length: usize,
    pub beam_size: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LanguagesResponse {
    pub languages: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub language: Option<String>,
}

/// A [`RuntimeError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub RuntimeError);

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &RuntimeError) -> StatusCode {
    match err {
        RuntimeError::UnsupportedLanguage(_) => StatusCode::BAD_REQUEST,
        RuntimeError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RuntimeError::LoadFailure(_) | RuntimeError::ArtifactMissing(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RuntimeError::Inference(_) | RuntimeError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        } else {
            tracing::debug!("request rejected: {}", self.0);
        }

        let language = match &self.0 {
            RuntimeError::UnsupportedLanguage(code) => Some(code.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
            language,
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metadata", get(metadata))
        .route("/languages", get(languages))
        .route("/translate", post(translate))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = match state.handle().state() {
        LoadState::Ready => "ready",
        LoadState::Unloaded | LoadState::Loading => "initializing",
    };
    Json(HealthResponse {
        status: status.to_string(),
    })
}

async fn metadata(State(state): State<AppState>) -> Result<Json<MetadataResponse>, ApiError> {
    let handle = state.handle().clone();
    // Before the first load this probes the host, which can touch the ONNX library.
    let params = tokio::task::spawn_blocking(move || handle.effective_params())
        .await
        .map_err(|e| RuntimeError::inference(format!("metadata task failed: {e}")))?;

    let config = state.handle().config();
    Ok(Json(MetadataResponse {
        model_id: config.model_id.clone(),
        device: params.device.to_string(),
        precision: params.precision_label(),
        max_length: config.max_length,
        beam_size: config.beam_size,
    }))
}

async fn languages(State(state): State<AppState>) -> Response {
    match state.handle().loaded() {
        Some(runtime) => Json(LanguagesResponse {
            languages: runtime.tokenizer().supported_languages(),
        })
        .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody {
                error: "initializing".to_string(),
                message: "model is not loaded yet".to_string(),
                language: None,
            }),
        )
            .into_response(),
    }
}

async fn translate(
    State(state): State<AppState>,
    payload: Result<Json<TranslationRequest>, JsonRejection>,
) -> Result<Json<TranslateResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| RuntimeError::InvalidRequest(e.body_text()))?;
    let translations = state.service.translate(request).await?;
    Ok(Json(TranslateResponse { translations }))
}

/// Load the model up front when the configuration asks for it.
pub async fn prepare(handle: &RuntimeHandle) -> Result<(), RuntimeError> {
    if handle.config().preload {
        tracing::info!("preloading model before accepting requests");
        handle.ensure_loaded().await?;
    }
    Ok(())
}

/// Preload if configured, then serve until the process is stopped.
pub async fn serve(handle: RuntimeHandle, server: &ServerConfig) -> anyhow::Result<()> {
    prepare(&handle).await?;

    let app = router(AppState::new(handle));
    let addr = server.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
