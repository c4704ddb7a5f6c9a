/**
 * Model artifact downloads
 *
 * fetch.rs       Hub listing + bounded concurrent download
 * downloader.rs  single streaming download with progress
 * manifest.rs    manifest-lock.json build and verification
 * registry.rs    ~/.locax/models/registry.json
 */
pub mod downloader;
pub mod fetch;
pub mod manifest;
pub mod registry;

pub use fetch::{fetch, FetchOptions};
pub use manifest::{ArtifactEntry, ArtifactManifest, VerifyIssue};
pub use registry::RegistryEntry;
