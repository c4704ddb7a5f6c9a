/**
 * HTTP surface tests
 * Router driven with tower's oneshot over the scripted echo runtime.
 */
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use m2m100_local::config::RuntimeConfig;
use m2m100_local::runtime::test_utils::CountingLoader;
use m2m100_local::runtime::RuntimeHandle;
use m2m100_local::server::{prepare, router, AppState};

fn state_with(loader: CountingLoader) -> AppState {
    let mut config = RuntimeConfig::new("/models/fake");
    config.model_id = "Xenova/m2m100_418M".to_string();
    AppState::new(RuntimeHandle::new(config, loader))
}

async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn startup_state(preload: bool) -> (AppState, Arc<CountingLoader>) {
    let loader = Arc::new(CountingLoader::new(&["en", "fr"]));
    let mut config = RuntimeConfig::new("/models/fake");
    config.preload = preload;
    let handle = RuntimeHandle::new(config, loader.clone());
    (AppState::new(handle), loader)
}

#[tokio::test]
async fn test_preload_loads_once_before_first_request() {
    let (state, loader) = startup_state(true);
    prepare(state.service.handle()).await.unwrap();
    assert_eq!(loader.loads(), 1);

    let (_, body) = send(&state, get("/health")).await;
    assert_eq!(body, json!({"status": "ready"}));

    let (status, _) = send(
        &state,
        post_json("/translate", json!({"source_text": "hi", "target_languages": ["fr"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(loader.loads(), 1);
}

#[tokio::test]
async fn test_without_preload_first_request_loads() {
    let (state, loader) = startup_state(false);
    prepare(state.service.handle()).await.unwrap();
    assert_eq!(loader.loads(), 0);

    let (_, body) = send(&state, get("/health")).await;
    assert_eq!(body, json!({"status": "initializing"}));

    let (status, _) = send(
        &state,
        post_json("/translate", json!({"source_text": "hi", "target_languages": ["fr"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(loader.loads(), 1);
}

#[tokio::test]
async fn test_health_reports_initializing_then_ready() {
    let state = state_with(CountingLoader::new(&["en", "fr"]));

    let (status, body) = send(&state, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "initializing"}));

    state.service.handle().ensure_loaded().await.unwrap();
    let (_, body) = send(&state, get("/health")).await;
    assert_eq!(body, json!({"status": "ready"}));
}

#[tokio::test]
async fn test_metadata() {
    let state = state_with(CountingLoader::new(&["en"]));
    let (status, body) = send(&state, get("/metadata")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "model_id": "Xenova/m2m100_418M",
            "device": "cpu",
            "precision": "fp32",
            "max_length": 256,
            "beam_size": 4
        })
    );
}

#[tokio::test]
async fn test_languages_unavailable_until_loaded() {
    let state = state_with(CountingLoader::new(&["fr", "en", "de"]));

    let (status, body) = send(&state, get("/languages")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "initializing");

    state.service.handle().ensure_loaded().await.unwrap();
    let (status, body) = send(&state, get("/languages")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"languages": ["de", "en", "fr"]}));
}

#[tokio::test]
async fn test_translate_fans_out() {
    let state = state_with(CountingLoader::new(&["en", "fr", "de"]));
    let (status, body) = send(
        &state,
        post_json(
            "/translate",
            json!({"source_text": "  Hello world ", "target_languages": ["fr", "de"]}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"translations": {"de": "Hello world", "fr": "Hello world"}})
    );
}

#[tokio::test]
async fn test_translate_unsupported_language_is_400() {
    let state = state_with(CountingLoader::new(&["en", "fr"]));
    let (status, body) = send(
        &state,
        post_json(
            "/translate",
            json!({"source_text": "Hello", "target_languages": ["fr", "xx"]}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unsupported_language");
    assert_eq!(body["language"], "xx");
}

#[tokio::test]
async fn test_translate_invalid_request_is_422() {
    let state = state_with(CountingLoader::new(&["en", "fr"]));

    let (status, body) = send(
        &state,
        post_json(
            "/translate",
            json!({"source_text": "Hello", "target_languages": ["fr"], "beam_size": 12}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "invalid_request");

    let (status, _) = send(
        &state,
        post_json("/translate", json!({"target_languages": ["fr"]})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_load_failure_is_503_then_recovers() {
    let state = state_with(CountingLoader::new(&["en", "fr"]).failing(1));
    let request = || {
        post_json(
            "/translate",
            json!({"source_text": "Hello", "target_languages": ["fr"]}),
        )
    };

    let (status, body) = send(&state, request()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "load_failure");

    let (status, body) = send(&state, request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["translations"]["fr"], "Hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_requests_load_once() {
    let loader = std::sync::Arc::new(
        CountingLoader::new(&["en", "fr"]).with_delay(Duration::from_millis(50)),
    );
    let state = AppState::new(RuntimeHandle::new(
        RuntimeConfig::new("/models/fake"),
        loader.clone(),
    ));

    let requests: Vec<_> = (0..8)
        .map(|i| {
            let state = state.clone();
            tokio::spawn(async move {
                send(
                    &state,
                    post_json(
                        "/translate",
                        json!({"source_text": format!("sentence {i}"), "target_languages": ["fr"]}),
                    ),
                )
                .await
            })
        })
        .collect();

    for (i, request) in requests.into_iter().enumerate() {
        let (status, body) = request.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["translations"]["fr"], format!("sentence {i}"));
    }
    assert_eq!(loader.loads(), 1);
}
