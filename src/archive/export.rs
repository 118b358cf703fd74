//! Archive export: snapshot every live clip into a deterministic tar.gz.

use std::io::Write;
use std::time::Instant;

use flate2::{Compression, GzBuilder};
use tar::{Builder, Header};
use tracing::{debug, info};

use super::manifest::{Manifest, ManifestEntry, MANIFEST_VERSION};
use super::{payload_path, ArchiveError, MANIFEST_PATH};
use crate::cache::ClipCache;
use crate::metrics::metric_names;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportReport {
    pub entries: usize,
    pub bytes: u64,
}

/// Emitted after each payload is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportProgress {
    pub written: usize,
    pub total: usize,
}

/// Write every unexpired clip to `writer`. Entries are ordered by creation time then
/// key, and headers carry fixed mtime/owner, so the same cache contents always produce
/// the same bytes. Reading payloads does not touch access times.
pub async fn export_archive<W, F>(
    cache: &ClipCache,
    writer: W,
    mut progress: F,
) -> Result<ExportReport, ArchiveError>
where
    W: Write,
    F: FnMut(ExportProgress),
{
    let started = Instant::now();
    let now = cache.now();
    let ttl_ms = cache.limits().ttl_ms();

    let mut metas = cache.list_metadata().await?;
    metas.retain(|m| !m.is_expired(now, ttl_ms));
    metas.sort_by(|a, b| {
        a.created_at_ms
            .cmp(&b.created_at_ms)
            .then_with(|| a.key.cmp(&b.key))
    });

    let mut entries = Vec::with_capacity(metas.len());
    let mut payloads = Vec::with_capacity(metas.len());
    for meta in metas {
        let Some(record) = cache.load(&meta.key).await? else {
            debug!(key = %meta.key, "clip vanished during export");
            continue;
        };
        let file = payload_path(record.meta.key.as_str(), record.meta.descriptor.extension());
        entries.push(ManifestEntry {
            key: record.meta.key.to_string(),
            bytes: record.payload.len() as u64,
            meta: record.meta.descriptor,
            file: file.clone(),
        });
        payloads.push((file, record.payload));
    }

    let manifest = Manifest {
        version: MANIFEST_VERSION,
        created_at: now,
        entries,
    };
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;

    let encoder = GzBuilder::new()
        .mtime(0)
        .operating_system(255)
        .write(writer, Compression::default());
    let mut tar = Builder::new(encoder);
    tar.mode(tar::HeaderMode::Deterministic);
    write_entry(&mut tar, MANIFEST_PATH, &manifest_bytes)?;

    let total = payloads.len();
    let mut report = ExportReport::default();
    for (path, payload) in &payloads {
        write_entry(&mut tar, path, payload)?;
        report.entries += 1;
        report.bytes += payload.len() as u64;
        progress(ExportProgress {
            written: report.entries,
            total,
        });
    }
    let encoder = tar.into_inner()?;
    encoder.finish()?;

    cache
        .metrics()
        .record(metric_names::EXPORT, started.elapsed().as_micros() as f64);
    info!(entries = report.entries, bytes = report.bytes, "cache exported");
    Ok(report)
}

fn write_entry<T: Write>(tar: &mut Builder<T>, path: &str, data: &[u8]) -> std::io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_path(path)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_username("voxcache")?;
    header.set_groupname("voxcache")?;
    header.set_cksum();
    tar.append(&header, data)
}
