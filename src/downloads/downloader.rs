/**
 * Streaming downloader
 *
 * Writes into `<dest>.part` and renames on completion, so an interrupted
 * download never leaves a file that looks complete.
 */
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;

use crate::error::FetchError;

/// Download progress information
#[derive(Debug, Clone, serde::Serialize)]
pub struct DownloadProgress {
    pub downloaded: u64,
    /// `None` when the server sent no Content-Length.
    pub total: Option<u64>,
    pub percent: Option<f64>,
    pub speed_mbps: f64,
}

/// HTTP client shared by every download of one fetch.
pub fn build_client() -> Result<Client, FetchError> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(1800)) // 30 minutes
        .user_agent(concat!("m2m100-local/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Download `url` to `dest`, reporting progress at most every 100ms.
pub async fn download_file<F>(
    client: &Client,
    url: &str,
    dest: &Path,
    token: Option<&str>,
    progress_callback: Option<F>,
) -> Result<PathBuf, FetchError>
where
    F: Fn(DownloadProgress) + Send + Sync,
{
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    tracing::debug!("downloading {} -> {}", url, dest.display());

    let mut request = client.get(url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await?;

    if !response.status().is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let total_size = response.content_length();
    let part = part_path(dest);
    let mut file = tokio::fs::File::create(&part).await?;

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    let start_time = Instant::now();
    let mut last_progress_time = start_time;

    while let Some(item) = stream.next().await {
        let chunk = item?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        let now = Instant::now();
        let finished = total_size == Some(downloaded);
        if now.duration_since(last_progress_time).as_millis() >= 100 || finished {
            last_progress_time = now;

            let elapsed = start_time.elapsed().as_secs_f64();
            let speed_mbps = if elapsed > 0.0 {
                (downloaded as f64 / elapsed) / 1_000_000.0
            } else {
                0.0
            };

            if let Some(ref callback) = progress_callback {
                callback(DownloadProgress {
                    downloaded,
                    total: total_size,
                    percent: total_size
                        .filter(|&total| total > 0)
                        .map(|total| downloaded as f64 / total as f64 * 100.0),
                    speed_mbps,
                });
            }
        }
    }

    file.flush().await?;
    drop(file);

    if let Some(expected) = total_size {
        if downloaded != expected {
            return Err(FetchError::Integrity(format!(
                "{url}: received {downloaded} of {expected} bytes"
            )));
        }
    }

    tokio::fs::rename(&part, dest).await?;
    tracing::debug!("download complete: {}", dest.display());
    Ok(dest.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/models/m2m/onnx/encoder_model.onnx")),
            PathBuf::from("/models/m2m/onnx/encoder_model.onnx.part")
        );
    }
}
