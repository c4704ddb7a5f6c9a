/**
 * Model Directories
 *
 * Default on-disk locations shared by the fetcher and the runtime.
 *
 * Everything lives under the user's home directory:
 * - ~/.locax/models/<model_dir>/          model artifacts
 * - ~/.locax/models/registry.json         local registry of fetched models
 */
use std::path::{Path, PathBuf};

/// Root folder name under the home directory
pub const APP_DIR: &str = ".locax";

/// Directory name of the default model checkout
pub const DEFAULT_MODEL_DIR: &str = "m2m100_418M";

/// Manifest file written next to the model artifacts
pub const MANIFEST_FILE: &str = "manifest-lock.json";

/// Get the app data directory (~/.locax)
pub fn get_app_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(APP_DIR))
}

/// Get the models directory
///
/// Returns: ~/.locax/models/
pub fn get_models_dir() -> Option<PathBuf> {
    get_app_data_dir().map(|dir| dir.join("models"))
}

/// Default model path used when neither the CLI nor the config file sets one
///
/// Falls back to a relative `models/` folder when no home directory is known.
pub fn default_model_path() -> PathBuf {
    get_models_dir()
        .unwrap_or_else(|| PathBuf::from("models"))
        .join(DEFAULT_MODEL_DIR)
}

/// Get the registry file path
///
/// Returns: ~/.locax/models/registry.json
pub fn default_registry_path() -> PathBuf {
    get_models_dir()
        .unwrap_or_else(|| PathBuf::from("models"))
        .join("registry.json")
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Manifest path for a model directory
pub fn manifest_path(model_dir: &Path) -> PathBuf {
    model_dir.join(MANIFEST_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_model_path_ends_with_model_dir() {
        let path = default_model_path();
        assert!(path.ends_with(Path::new("models").join(DEFAULT_MODEL_DIR)));
    }

    #[test]
    fn test_expand_home_leaves_absolute_paths() {
        let path = Path::new("/opt/models/m2m100");
        assert_eq!(expand_home(path), path.to_path_buf());
    }

    #[test]
    fn test_expand_home_replaces_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/models")), home.join("models"));
        }
    }
}
