/**
 * Local registry of fetched models (`~/.locax/models/registry.json`).
 */
use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::downloads::manifest::ArtifactManifest;
use crate::error::FetchError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub path: String,
    pub revision: String,
    pub precision: String,
    pub downloaded_at: String,
}

/// Model id to entry.
pub type Registry = BTreeMap<String, RegistryEntry>;

/// Read the registry; a missing or unreadable file counts as empty.
pub fn load_registry(registry_path: &Path) -> Registry {
    let Ok(text) = std::fs::read_to_string(registry_path) else {
        return Registry::new();
    };
    match serde_json::from_str(&text) {
        Ok(registry) => registry,
        Err(e) => {
            tracing::warn!(
                "ignoring invalid registry {}: {e}",
                registry_path.display()
            );
            Registry::new()
        }
    }
}

/// Insert or replace the entry for the manifest's model, keeping all others.
pub fn persist_registry_entry(
    registry_path: &Path,
    model_dir: &Path,
    manifest: &ArtifactManifest,
) -> Result<Registry, FetchError> {
    if let Some(parent) = registry_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut registry = load_registry(registry_path);
    registry.insert(
        manifest.model_id.clone(),
        RegistryEntry {
            path: model_dir.display().to_string(),
            revision: manifest.revision.clone(),
            precision: manifest.precision.clone(),
            downloaded_at: manifest.downloaded_at.clone(),
        },
    );

    std::fs::write(registry_path, serde_json::to_string_pretty(&registry)?)?;
    Ok(registry)
}
