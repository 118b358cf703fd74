//! Eviction: prunes the store against max age, max entries and max bytes.
//! Records are visited least recently accessed first and the pass stops at the first
//! record that violates nothing. Requests are coalesced: while a pass is pending,
//! further requests are absorbed instead of queued.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cache::{CacheInner, ClipCache};
use crate::error::CacheError;
use crate::limits::CacheLimits;
use crate::metrics::metric_names;
use crate::store::ClipMeta;
use crate::summary::SummaryDelta;

/// Latest point at which a requested pass should run.
pub const PRUNE_DEADLINE: Duration = Duration::from_secs(2);

/// Deletions between idle yields inside one pass.
const YIELD_EVERY: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Expired,
    OverCount,
    OverBytes,
}

/// First limit `meta` violates given the live totals, or `None` if it may stay.
pub fn eviction_reason(
    meta: &ClipMeta,
    limits: &CacheLimits,
    now_ms: i64,
    live_entries: u64,
    live_bytes: u64,
) -> Option<EvictionReason> {
    if meta.is_expired(now_ms, limits.ttl_ms()) {
        Some(EvictionReason::Expired)
    } else if live_entries > limits.max_entries {
        Some(EvictionReason::OverCount)
    } else if live_bytes > limits.max_bytes {
        Some(EvictionReason::OverBytes)
    } else {
        None
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: u64,
    pub expired: u64,
    pub freed_bytes: u64,
    pub remaining_entries: u64,
    pub remaining_bytes: u64,
}

/// Clears the pending flag when the scheduled job runs or is dropped unrun.
struct PendingReset(Arc<CacheInner>);

impl Drop for PendingReset {
    fn drop(&mut self) {
        self.0.prune_pending.store(false, Ordering::Release);
    }
}

impl ClipCache {
    /// Run one eviction pass now. Idempotent; the summary is persisted once at the end.
    pub async fn prune(&self) -> Result<PruneReport, CacheError> {
        let inner = &self.inner;
        let now = inner.now();
        inner.ensure_summary(now).await;

        let started = Instant::now();
        let limits = inner.current_limits();
        let metas = inner.storage.list_metadata().await?;
        let mut live_entries = metas.len() as u64;
        let mut live_bytes: u64 = metas.iter().map(|m| m.bytes).sum();
        let mut report = PruneReport::default();
        let mut failure = None;

        for meta in &metas {
            let Some(reason) = eviction_reason(meta, &limits, now, live_entries, live_bytes) else {
                break;
            };
            match inner.storage.delete(&meta.key).await {
                Ok(Some(bytes)) => {
                    live_entries = live_entries.saturating_sub(1);
                    live_bytes = live_bytes.saturating_sub(bytes);
                    inner.summary.apply(SummaryDelta::removed(bytes), now);
                    report.removed += 1;
                    report.freed_bytes += bytes;
                    if reason == EvictionReason::Expired {
                        report.expired += 1;
                    }
                    debug!(key = %meta.key, ?reason, "clip evicted");
                }
                Ok(None) => {
                    // Removed concurrently; whoever removed it adjusted the summary.
                    live_entries = live_entries.saturating_sub(1);
                    live_bytes = live_bytes.saturating_sub(meta.bytes);
                }
                Err(e) => {
                    warn!(error = %e, key = %meta.key, "eviction delete failed");
                    failure = Some(e);
                    break;
                }
            }
            if report.removed > 0 && report.removed % YIELD_EVERY == 0 {
                inner.scheduler.yield_now().await;
            }
        }

        if report.removed > 0 {
            inner.summary.persist(inner.storage.as_ref()).await;
            info!(
                removed = report.removed,
                expired = report.expired,
                freed_bytes = report.freed_bytes,
                "prune pass complete"
            );
        }
        inner
            .metrics
            .record(metric_names::PRUNE_PASS, started.elapsed().as_micros() as f64);

        if let Some(e) = failure {
            return Err(e.into());
        }
        report.remaining_entries = live_entries;
        report.remaining_bytes = live_bytes;
        Ok(report)
    }

    /// Ask for a prune pass at the next idle point. Absorbed if one is already pending.
    pub fn request_prune(&self) {
        if self.inner.prune_pending.swap(true, Ordering::AcqRel) {
            debug!("prune already pending");
            return;
        }
        let reset = PendingReset(Arc::clone(&self.inner));
        let cache = self.clone();
        self.inner.scheduler.schedule(
            PRUNE_DEADLINE,
            Box::pin(async move {
                drop(reset);
                if let Err(e) = cache.prune().await {
                    warn!(error = %e, "scheduled prune failed");
                }
            }),
        );
    }

    /// Whether a prune pass is scheduled but has not started.
    pub fn prune_pending(&self) -> bool {
        self.inner.prune_pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::SynthesisDescriptor;
    use crate::key::derive_key;

    fn meta(created: i64, bytes: u64) -> ClipMeta {
        let d = SynthesisDescriptor::new("x");
        ClipMeta {
            key: derive_key(&d),
            bytes,
            created_at_ms: created,
            last_access_ms: created,
            descriptor: d.resolve(),
        }
    }

    #[test]
    fn nothing_to_evict_within_limits() {
        let limits = CacheLimits::default();
        assert_eq!(eviction_reason(&meta(0, 10), &limits, 10, 1, 10), None);
    }

    #[test]
    fn each_limit_triggers_independently() {
        let limits = CacheLimits {
            max_entries: 2,
            max_bytes: crate::limits::MIB,
            ttl_secs: 3600,
        };
        let ttl_ms = 3_600_000;
        assert_eq!(
            eviction_reason(&meta(0, 1), &limits, ttl_ms + 1, 1, 1),
            Some(EvictionReason::Expired)
        );
        assert_eq!(eviction_reason(&meta(0, 1), &limits, ttl_ms, 1, 1), None);
        assert_eq!(
            eviction_reason(&meta(0, 1), &limits, 0, 3, 1),
            Some(EvictionReason::OverCount)
        );
        assert_eq!(
            eviction_reason(&meta(0, 1), &limits, 0, 2, crate::limits::MIB + 1),
            Some(EvictionReason::OverBytes)
        );
    }
}
