//! Portable cache archives.
//! A gzip-compressed tar with `manifest.json` at the root and one payload per clip
//! under `clips/<key><ext>`. Import validates everything before writing anything.

pub mod export;
pub mod import;
pub mod manifest;

pub use export::{export_archive, ExportProgress, ExportReport};
pub use import::{import_archive, import_archive_with_limits, ImportProgress, ImportReport};
pub use manifest::{Manifest, ManifestEntry, MANIFEST_VERSION};

use thiserror::Error;

use crate::error::CacheError;

pub const MANIFEST_PATH: &str = "manifest.json";
pub const PAYLOAD_DIR: &str = "clips";

/// Archive path for a payload: `clips/<key><ext>`.
pub fn payload_path(key: &str, extension: &str) -> String {
    format!("{PAYLOAD_DIR}/{key}{extension}")
}

/// Resource limits applied while reading an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLimits {
    pub max_archive_bytes: u64,
    pub max_decoded_bytes: u64,
    pub max_manifest_bytes: u64,
    pub max_payload_bytes: u64,
    pub max_entries: usize,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_archive_bytes: 512 * 1024 * 1024,  // 512 MB compressed
            max_decoded_bytes: 1024 * 1024 * 1024, // 1 GB uncompressed
            max_manifest_bytes: 16 * 1024 * 1024,  // 16 MB
            max_payload_bytes: 64 * 1024 * 1024,   // 64 MB per clip
            max_entries: 100_000,
        }
    }
}

/// Why an export or import failed. Import variants name the rule that was broken.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive exceeds limit: {0}")]
    LimitExceeded(&'static str),
    #[error("archive has no manifest.json")]
    MissingManifest,
    #[error("archive has more than one manifest.json")]
    DuplicateManifest,
    #[error("manifest is not valid JSON: {0}")]
    InvalidManifest(#[from] serde_json::Error),
    #[error("unsupported manifest version {0:?}")]
    UnsupportedVersion(Option<u64>),
    #[error("entry {index}: key missing or contains a path separator")]
    InvalidKey { index: usize },
    #[error("entry {index} ({key}): file path {path:?} escapes the clips/ namespace")]
    UnsafePath { index: usize, key: String, path: String },
    #[error("entry {index} ({key}): unsupported audio extension in {path:?}")]
    UnsupportedExtension { index: usize, key: String, path: String },
    #[error("entry {index} ({key}): file path {path:?} does not match expected {expected:?}")]
    PathMismatch {
        index: usize,
        key: String,
        path: String,
        expected: String,
    },
    #[error("entry {index} ({key}): declared format {format:?} does not match extension {extension}")]
    FormatMismatch {
        index: usize,
        key: String,
        format: String,
        extension: String,
    },
    #[error("entry {index} ({key}): payload {path:?} missing from archive")]
    MissingPayload { index: usize, key: String, path: String },
    #[error("entry {index} ({key}): declared {declared} bytes, payload has {actual}")]
    ByteLengthMismatch {
        index: usize,
        key: String,
        declared: i64,
        actual: u64,
    },
    #[error("entry {index} ({key}): metadata missing or has no text")]
    InvalidMetadata { index: usize, key: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
}
