/**
 * `manifest-lock.json`: size and sha256 of every fetched artifact.
 */
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::FetchError;
use crate::paths::{self, MANIFEST_FILE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Relative to the model directory, `/`-separated.
    pub path: String,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub model_id: String,
    pub revision: String,
    pub precision: String,
    pub downloaded_at: String,
    pub artifacts: Vec<ArtifactEntry>,
}

/// Something `verify` found wrong with a model directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyIssue {
    Missing(String),
    SizeMismatch { path: String, expected: u64, actual: u64 },
    HashMismatch(String),
}

impl fmt::Display for VerifyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(path) => write!(f, "{path}: missing"),
            Self::SizeMismatch {
                path,
                expected,
                actual,
            } => write!(f, "{path}: expected {expected} bytes, found {actual}"),
            Self::HashMismatch(path) => write!(f, "{path}: sha256 mismatch"),
        }
    }
}

pub fn sha256_file(path: &Path) -> Result<String, FetchError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

fn is_bookkeeping(rel: &str) -> bool {
    rel == MANIFEST_FILE || rel.ends_with(".part")
}

impl ArtifactManifest {
    /// Hash every file under `model_dir`, sorted by path.
    pub fn build(
        model_dir: &Path,
        model_id: &str,
        revision: &str,
        precision: &str,
    ) -> Result<Self, FetchError> {
        let mut artifacts = Vec::new();
        for entry in WalkDir::new(model_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| FetchError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = relative_path(model_dir, entry.path()) else {
                continue;
            };
            if is_bookkeeping(&rel) {
                continue;
            }

            artifacts.push(ArtifactEntry {
                size_bytes: entry.metadata().map_err(|e| FetchError::Io(e.into()))?.len(),
                sha256: sha256_file(entry.path())?,
                path: rel,
            });
        }
        artifacts.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(Self {
            model_id: model_id.to_string(),
            revision: revision.to_string(),
            precision: precision.to_string(),
            downloaded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            artifacts,
        })
    }

    pub fn path_in(model_dir: &Path) -> PathBuf {
        paths::manifest_path(model_dir)
    }

    pub fn write(&self, model_dir: &Path) -> Result<PathBuf, FetchError> {
        let path = Self::path_in(model_dir);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(model_dir: &Path) -> Result<Self, FetchError> {
        let text = std::fs::read_to_string(Self::path_in(model_dir))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn total_bytes(&self) -> u64 {
        self.artifacts.iter().map(|a| a.size_bytes).sum()
    }

    /// Re-hash the listed artifacts. An empty result means the directory matches.
    pub fn verify(&self, model_dir: &Path) -> Result<Vec<VerifyIssue>, FetchError> {
        let mut issues = Vec::new();
        for artifact in &self.artifacts {
            let path = model_dir.join(&artifact.path);
            let metadata = match std::fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    issues.push(VerifyIssue::Missing(artifact.path.clone()));
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if metadata.len() != artifact.size_bytes {
                issues.push(VerifyIssue::SizeMismatch {
                    path: artifact.path.clone(),
                    expected: artifact.size_bytes,
                    actual: metadata.len(),
                });
                continue;
            }
            if sha256_file(&path)? != artifact.sha256 {
                issues.push(VerifyIssue::HashMismatch(artifact.path.clone()));
            }
        }
        Ok(issues)
    }
}
