//! Aggregate entry count / byte total, mirrored in its own storage slot so readers
//! never scan the clip table. Loaded (or reconciled by full scan) on first use, then
//! adjusted incrementally by every mutation. The store stays the source of truth.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

use crate::store::{ClipStorage, StorageError, SUMMARY_SLOT};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSummary {
    pub entry_count: u64,
    pub total_bytes: u64,
    pub updated_at: i64,
}

/// Signed change to apply to the summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryDelta {
    pub entries: i64,
    pub bytes: i64,
}

impl SummaryDelta {
    pub fn added(bytes: u64) -> Self {
        Self {
            entries: 1,
            bytes: bytes as i64,
        }
    }

    pub fn removed(bytes: u64) -> Self {
        Self {
            entries: -1,
            bytes: -(bytes as i64),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.entries == 0 && self.bytes == 0
    }
}

impl std::ops::AddAssign for SummaryDelta {
    fn add_assign(&mut self, rhs: Self) {
        self.entries += rhs.entries;
        self.bytes += rhs.bytes;
    }
}

pub struct SummaryTracker {
    snapshot: Mutex<CacheSummary>,
    loaded: OnceCell<()>,
    tx: watch::Sender<CacheSummary>,
}

impl SummaryTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CacheSummary::default());
        Self {
            snapshot: Mutex::new(CacheSummary::default()),
            loaded: OnceCell::new(),
            tx,
        }
    }

    /// Load the persisted summary once; reconcile from a full scan if none exists.
    /// A failed reconciliation leaves the tracker unloaded so the next call retries.
    pub async fn ensure_loaded(&self, storage: &dyn ClipStorage, now_ms: i64) {
        let loaded = self
            .loaded
            .get_or_try_init(|| async {
                match read_persisted(storage).await {
                    Ok(Some(summary)) => {
                        *self.snapshot.lock() = summary;
                        self.set_quietly(summary);
                        debug!(entries = summary.entry_count, bytes = summary.total_bytes, "summary loaded");
                        Ok(())
                    }
                    Ok(None) => self.reconcile(storage, now_ms).await.map(|_| ()),
                    Err(e) => {
                        warn!(error = %e, "summary slot unreadable, reconciling");
                        self.reconcile(storage, now_ms).await.map(|_| ())
                    }
                }
            })
            .await;
        if let Err(e) = loaded {
            warn!(error = %e, "summary reconciliation failed, will retry on next use");
        }
    }

    /// Recompute from a full scan of the store and persist. Does not notify observers.
    pub async fn reconcile(
        &self,
        storage: &dyn ClipStorage,
        now_ms: i64,
    ) -> Result<CacheSummary, StorageError> {
        let metas = storage.list_metadata().await?;
        let summary = CacheSummary {
            entry_count: metas.len() as u64,
            total_bytes: metas.iter().map(|m| m.bytes).sum(),
            updated_at: now_ms,
        };
        *self.snapshot.lock() = summary;
        self.set_quietly(summary);
        storage
            .write_slot(SUMMARY_SLOT, &serde_json::to_string(&summary)?)
            .await?;
        info!(entries = summary.entry_count, bytes = summary.total_bytes, "summary reconciled");
        Ok(summary)
    }

    fn set_quietly(&self, summary: CacheSummary) {
        self.tx.send_if_modified(|current| {
            *current = summary;
            false
        });
    }

    pub fn snapshot(&self) -> CacheSummary {
        *self.snapshot.lock()
    }

    /// Adjust the in-memory snapshot. Counts saturate at zero.
    pub fn apply(&self, delta: SummaryDelta, now_ms: i64) -> CacheSummary {
        let mut snapshot = self.snapshot.lock();
        snapshot.entry_count = snapshot.entry_count.saturating_add_signed(delta.entries);
        snapshot.total_bytes = snapshot.total_bytes.saturating_add_signed(delta.bytes);
        snapshot.updated_at = now_ms;
        *snapshot
    }

    /// Reset to zero (after the store was cleared).
    pub fn reset(&self, now_ms: i64) -> CacheSummary {
        let mut snapshot = self.snapshot.lock();
        *snapshot = CacheSummary {
            updated_at: now_ms,
            ..CacheSummary::default()
        };
        *snapshot
    }

    /// Persist the current snapshot and notify observers. Failures are logged only.
    pub async fn persist(&self, storage: &dyn ClipStorage) {
        let summary = self.snapshot();
        match serde_json::to_string(&summary) {
            Ok(json) => {
                if let Err(e) = storage.write_slot(SUMMARY_SLOT, &json).await {
                    warn!(error = %e, "summary persist failed");
                }
            }
            Err(e) => warn!(error = %e, "summary encode failed"),
        }
        self.tx.send_replace(summary);
    }

    /// Apply a delta and persist it in one step.
    pub async fn record(&self, storage: &dyn ClipStorage, delta: SummaryDelta, now_ms: i64) {
        if delta.is_zero() {
            return;
        }
        self.apply(delta, now_ms);
        self.persist(storage).await;
    }

    /// Subscribe to persisted summary changes.
    pub fn subscribe(&self) -> watch::Receiver<CacheSummary> {
        self.tx.subscribe()
    }
}

impl Default for SummaryTracker {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_persisted(storage: &dyn ClipStorage) -> Result<Option<CacheSummary>, StorageError> {
    match storage.read_slot(SUMMARY_SLOT).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}
