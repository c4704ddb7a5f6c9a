/**
 * Artifact fetcher
 *
 * Lists a Hub repository at one revision, downloads every file into the
 * target directory, then writes manifest-lock.json and records the model
 * in the local registry.
 */
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;

use crate::config::DEFAULT_MODEL_ID;
use crate::downloads::downloader::{self, DownloadProgress};
use crate::downloads::manifest::ArtifactManifest;
use crate::downloads::registry;
use crate::error::FetchError;
use crate::paths;

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
pub const DEFAULT_REVISION: &str = "main";
pub const DEFAULT_MAX_WORKERS: usize = 5;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub model_id: String,
    pub revision: String,
    pub target_dir: PathBuf,
    /// Recorded in the manifest and registry; does not filter files.
    pub precision: String,
    pub token: Option<String>,
    pub clean: bool,
    pub max_workers: usize,
    pub endpoint: String,
    pub registry_path: PathBuf,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            revision: DEFAULT_REVISION.to_string(),
            target_dir: paths::default_model_path(),
            precision: "float16".to_string(),
            token: None,
            clean: false,
            max_workers: DEFAULT_MAX_WORKERS,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            registry_path: paths::default_registry_path(),
        }
    }
}

/// One file of a Hub repository.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepoFile {
    pub rfilename: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoInfo {
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub siblings: Vec<RepoFile>,
}

fn model_info_url(endpoint: &str, model_id: &str, revision: &str) -> String {
    format!(
        "{}/api/models/{model_id}/revision/{revision}?blobs=true",
        endpoint.trim_end_matches('/')
    )
}

fn file_url(endpoint: &str, model_id: &str, revision: &str, file: &str) -> String {
    format!(
        "{}/{model_id}/resolve/{revision}/{file}",
        endpoint.trim_end_matches('/')
    )
}

/// Destination of a repository file, refusing paths that escape `target_dir`.
fn local_path(target_dir: &Path, rfilename: &str) -> Result<PathBuf, FetchError> {
    let rel = Path::new(rfilename);
    let safe = !rfilename.is_empty() && rel.components().all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(FetchError::Integrity(format!(
            "refusing to write repository file outside the target directory: {rfilename}"
        )));
    }
    Ok(target_dir.join(rel))
}

/// A file is kept when it exists with the size the Hub reports.
fn is_present(path: &Path, expected_size: Option<u64>) -> bool {
    match (std::fs::metadata(path), expected_size) {
        (Ok(metadata), Some(size)) => metadata.is_file() && metadata.len() == size,
        _ => false,
    }
}

pub async fn list_repo_files(
    client: &Client,
    options: &FetchOptions,
) -> Result<RepoInfo, FetchError> {
    let url = model_info_url(&options.endpoint, &options.model_id, &options.revision);
    let mut request = client.get(&url);
    if let Some(token) = &options.token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(FetchError::Status {
            url,
            status: response.status().as_u16(),
        });
    }
    Ok(response.json::<RepoInfo>().await?)
}

async fn fetch_one(
    client: &Client,
    options: &FetchOptions,
    file: &RepoFile,
) -> Result<bool, FetchError> {
    let dest = local_path(&options.target_dir, &file.rfilename)?;
    if is_present(&dest, file.size) {
        tracing::debug!("{} already present, skipping", file.rfilename);
        return Ok(false);
    }

    let url = file_url(
        &options.endpoint,
        &options.model_id,
        &options.revision,
        &file.rfilename,
    );
    let name = file.rfilename.as_str();
    let last_decile = AtomicU64::new(0);
    let on_progress = |progress: DownloadProgress| {
        let Some(percent) = progress.percent else {
            return;
        };
        let decile = (percent / 10.0) as u64;
        if decile > last_decile.swap(decile, Ordering::Relaxed) {
            tracing::info!(
                "{}: {:.0}% ({:.1} MB/s)",
                name,
                percent,
                progress.speed_mbps
            );
        }
    };

    downloader::download_file(
        client,
        &url,
        &dest,
        options.token.as_deref(),
        Some(on_progress),
    )
    .await?;
    Ok(true)
}

/// Download the repository, write the manifest and update the registry.
pub async fn fetch(options: &FetchOptions) -> Result<ArtifactManifest, FetchError> {
    let target_dir = paths::expand_home(&options.target_dir);
    let options = FetchOptions {
        target_dir: target_dir.clone(),
        max_workers: options.max_workers.max(1),
        ..options.clone()
    };

    if options.clean && target_dir.exists() {
        tracing::info!("removing existing files in {}", target_dir.display());
        tokio::fs::remove_dir_all(&target_dir).await?;
    }
    tokio::fs::create_dir_all(&target_dir).await?;

    let client = downloader::build_client()?;
    let info = list_repo_files(&client, &options).await?;
    tracing::info!(
        model_id = %options.model_id,
        revision = %options.revision,
        commit = info.sha.as_deref().unwrap_or("unknown"),
        files = info.siblings.len(),
        "downloading to {}",
        target_dir.display()
    );

    let mut downloads = stream::iter(info.siblings.iter())
        .map(|file| fetch_one(&client, &options, file))
        .buffer_unordered(options.max_workers);

    let mut fetched = 0usize;
    while let Some(result) = downloads.next().await {
        if result? {
            fetched += 1;
        }
    }
    tracing::info!(
        fetched,
        skipped = info.siblings.len() - fetched,
        "all files downloaded"
    );

    let manifest = tokio::task::spawn_blocking({
        let options = options.clone();
        move || {
            let manifest = ArtifactManifest::build(
                &options.target_dir,
                &options.model_id,
                &options.revision,
                &options.precision,
            )?;
            let manifest_path = manifest.write(&options.target_dir)?;
            tracing::info!("manifest saved to {}", manifest_path.display());
            registry::persist_registry_entry(&options.registry_path, &options.target_dir, &manifest)?;
            Ok::<_, FetchError>(manifest)
        }
    })
    .await
    .map_err(|e| FetchError::Io(std::io::Error::other(e)))??;

    Ok(manifest)
}
