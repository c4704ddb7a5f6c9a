/**
 * Fetcher tests against a local stand-in for the Hub.
 */
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;

use m2m100_local::downloads::fetch::{fetch, FetchOptions};
use m2m100_local::downloads::manifest::ArtifactManifest;
use m2m100_local::downloads::registry::load_registry;
use m2m100_local::error::FetchError;

#[derive(Clone)]
struct Hub {
    files: Arc<HashMap<String, Vec<u8>>>,
    downloads: Arc<AtomicUsize>,
}

async fn model_info(State(hub): State<Hub>) -> Json<serde_json::Value> {
    let siblings: Vec<_> = hub
        .files
        .iter()
        .map(|(name, bytes)| json!({"rfilename": name, "size": bytes.len()}))
        .collect();
    Json(json!({"id": "org/tiny", "sha": "0123abcd", "siblings": siblings}))
}

async fn resolve(State(hub): State<Hub>, UrlPath(path): UrlPath<String>) -> Response {
    match hub.files.get(&path) {
        Some(bytes) => {
            hub.downloads.fetch_add(1, Ordering::SeqCst);
            bytes.clone().into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_hub(files: &[(&str, &[u8])]) -> (SocketAddr, Arc<AtomicUsize>) {
    let hub = Hub {
        files: Arc::new(
            files
                .iter()
                .map(|(name, bytes)| (name.to_string(), bytes.to_vec()))
                .collect(),
        ),
        downloads: Arc::new(AtomicUsize::new(0)),
    };
    let downloads = hub.downloads.clone();

    let app = Router::new()
        .route("/api/models/org/tiny/revision/main", get(model_info))
        .route("/org/tiny/resolve/main/*path", get(resolve))
        .with_state(hub);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, downloads)
}

fn options(addr: SocketAddr, root: &Path) -> FetchOptions {
    FetchOptions {
        model_id: "org/tiny".to_string(),
        revision: "main".to_string(),
        target_dir: root.join("models/tiny"),
        precision: "int8".to_string(),
        token: Some("hf_test".to_string()),
        clean: false,
        max_workers: 2,
        endpoint: format!("http://{addr}"),
        registry_path: root.join("models/registry.json"),
    }
}

const FILES: &[(&str, &[u8])] = &[
    ("config.json", b"{\"model_type\":\"m2m_100\"}"),
    ("tokenizer.json", b"{}"),
    ("onnx/encoder_model_quantized.onnx", b"encoder-bytes"),
    ("onnx/decoder_model_quantized.onnx", b"decoder-bytes"),
];

#[tokio::test]
async fn test_fetch_writes_files_manifest_and_registry() {
    let (addr, downloads) = start_hub(FILES).await;
    let root = tempfile::tempdir().unwrap();
    let options = options(addr, root.path());

    let manifest = fetch(&options).await.unwrap();
    assert_eq!(downloads.load(Ordering::SeqCst), 4);

    let paths: Vec<&str> = manifest.artifacts.iter().map(|a| a.path.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            "config.json",
            "onnx/decoder_model_quantized.onnx",
            "onnx/encoder_model_quantized.onnx",
            "tokenizer.json"
        ]
    );
    assert_eq!(manifest.precision, "int8");
    assert_eq!(
        std::fs::read(options.target_dir.join("onnx/encoder_model_quantized.onnx")).unwrap(),
        b"encoder-bytes"
    );

    let on_disk = ArtifactManifest::load(&options.target_dir).unwrap();
    assert_eq!(on_disk, manifest);
    assert!(on_disk.verify(&options.target_dir).unwrap().is_empty());

    let registry = load_registry(&options.registry_path);
    let entry = &registry["org/tiny"];
    assert_eq!(entry.revision, "main");
    assert_eq!(entry.precision, "int8");
    assert_eq!(entry.path, options.target_dir.display().to_string());
}

#[tokio::test]
async fn test_refetch_skips_present_files() {
    let (addr, downloads) = start_hub(FILES).await;
    let root = tempfile::tempdir().unwrap();
    let options = options(addr, root.path());

    fetch(&options).await.unwrap();
    fetch(&options).await.unwrap();
    assert_eq!(downloads.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_clean_removes_stale_files() {
    let (addr, downloads) = start_hub(FILES).await;
    let root = tempfile::tempdir().unwrap();
    let mut options = options(addr, root.path());

    std::fs::create_dir_all(&options.target_dir).unwrap();
    std::fs::write(options.target_dir.join("stale.bin"), b"old").unwrap();
    options.clean = true;

    let manifest = fetch(&options).await.unwrap();
    assert!(!options.target_dir.join("stale.bin").exists());
    assert!(manifest.artifacts.iter().all(|a| a.path != "stale.bin"));
    assert_eq!(downloads.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_unknown_repository_is_status_error() {
    let (addr, _) = start_hub(FILES).await;
    let root = tempfile::tempdir().unwrap();
    let mut options = options(addr, root.path());
    options.model_id = "org/missing".to_string();

    match fetch(&options).await {
        Err(FetchError::Status { status, .. }) => assert_eq!(status, 404),
        other => panic!("expected a 404 status error, got {other:?}"),
    }
}
