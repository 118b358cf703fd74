//! Archive import: validate the whole archive, then add clips whose keys are absent.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::time::Instant;

use flate2::read::GzDecoder;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::manifest::{check_version, validate_entry, RawManifest, ValidatedEntry};
use super::{ArchiveError, ArchiveLimits, MANIFEST_PATH, PAYLOAD_DIR};
use crate::cache::ClipCache;
use crate::metrics::metric_names;
use crate::store::ClipRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub added: u64,
    pub skipped: u64,
    pub bytes: u64,
}

/// Emitted after each manifest entry is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportProgress {
    pub processed: usize,
    pub total: usize,
    pub added: u64,
    pub skipped: u64,
}

/// Manifest bytes plus regular files under `clips/`, keyed by archive path.
struct ArchiveContents {
    manifest: Vec<u8>,
    payloads: HashMap<String, Vec<u8>>,
}

/// Import with [`ArchiveLimits::default`].
pub async fn import_archive<R, F>(
    cache: &ClipCache,
    reader: R,
    progress: F,
) -> Result<ImportReport, ArchiveError>
where
    R: Read,
    F: FnMut(ImportProgress),
{
    import_archive_with_limits(cache, reader, ArchiveLimits::default(), progress).await
}

/// Read and validate every entry before the store is touched; any failure leaves it
/// unchanged. Records keep existing keys, take the import time as their creation and
/// access time, and each insertion is followed by a prune pass.
pub async fn import_archive_with_limits<R, F>(
    cache: &ClipCache,
    reader: R,
    limits: ArchiveLimits,
    mut progress: F,
) -> Result<ImportReport, ArchiveError>
where
    R: Read,
    F: FnMut(ImportProgress),
{
    let started = Instant::now();
    let contents = read_archive(reader, &limits)?;
    let entries = validate_manifest(&contents, &limits)?;

    let total = entries.len();
    let mut report = ImportReport::default();
    for (index, entry) in entries.into_iter().enumerate() {
        let bytes = entry.payload.len() as u64;
        let record = ClipRecord::new(entry.key, entry.meta, entry.payload, cache.now());
        let key = record.key().clone();
        if cache.insert_if_absent(record).await? {
            report.added += 1;
            report.bytes += bytes;
            debug!(%key, bytes, "clip imported");
            cache.prune().await?;
        } else {
            report.skipped += 1;
        }
        progress(ImportProgress {
            processed: index + 1,
            total,
            added: report.added,
            skipped: report.skipped,
        });
    }

    cache
        .metrics()
        .record(metric_names::IMPORT, started.elapsed().as_micros() as f64);
    info!(
        added = report.added,
        skipped = report.skipped,
        bytes = report.bytes,
        "archive imported"
    );
    Ok(report)
}

fn read_archive<R: Read>(reader: R, limits: &ArchiveLimits) -> Result<ArchiveContents, ArchiveError> {
    let mut compressed = Vec::new();
    reader
        .take(limits.max_archive_bytes.saturating_add(1))
        .read_to_end(&mut compressed)?;
    if compressed.len() as u64 > limits.max_archive_bytes {
        return Err(ArchiveError::LimitExceeded("archive size"));
    }

    let decoder = GzDecoder::new(Cursor::new(compressed));
    let mut archive = tar::Archive::new(decoder);
    let mut manifest = None;
    let mut payloads = HashMap::new();
    let mut decoded: u64 = 0;
    let mut members: usize = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        members += 1;
        // Manifest plus one payload per entry.
        if members > limits.max_entries.saturating_add(1) {
            return Err(ArchiveError::LimitExceeded("archive member count"));
        }
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().to_string();
        let size = entry.header().size()?;

        let cap = if path == MANIFEST_PATH {
            if manifest.is_some() {
                return Err(ArchiveError::DuplicateManifest);
            }
            limits.max_manifest_bytes
        } else if path
            .strip_prefix(PAYLOAD_DIR)
            .is_some_and(|rest| rest.starts_with('/'))
        {
            limits.max_payload_bytes
        } else {
            debug!(%path, "ignoring unexpected archive member");
            continue;
        };
        if size > cap {
            return Err(ArchiveError::LimitExceeded(if path == MANIFEST_PATH {
                "manifest size"
            } else {
                "payload size"
            }));
        }
        decoded = decoded.saturating_add(size);
        if decoded > limits.max_decoded_bytes {
            return Err(ArchiveError::LimitExceeded("decoded size"));
        }

        let mut data = Vec::with_capacity(size as usize);
        entry.by_ref().take(cap).read_to_end(&mut data)?;
        if path == MANIFEST_PATH {
            manifest = Some(data);
        } else if payloads.insert(path.clone(), data).is_some() {
            warn!(%path, "payload appears twice, keeping the last copy");
        }
    }

    Ok(ArchiveContents {
        manifest: manifest.ok_or(ArchiveError::MissingManifest)?,
        payloads,
    })
}

fn validate_manifest(
    contents: &ArchiveContents,
    limits: &ArchiveLimits,
) -> Result<Vec<ValidatedEntry>, ArchiveError> {
    let value: Value = serde_json::from_slice(&contents.manifest)?;
    check_version(&value)?;
    let manifest: RawManifest = serde_json::from_value(value)?;
    if manifest.entries.len() > limits.max_entries {
        return Err(ArchiveError::LimitExceeded("manifest entry count"));
    }
    manifest
        .entries
        .iter()
        .enumerate()
        .map(|(index, entry)| validate_entry(index, entry, &contents.payloads))
        .collect()
}
