//! Clip cache manager.
//! Owns the storage handle, the summary snapshot, the live limits and the idle
//! scheduler. Every public operation is one storage transaction followed by the
//! matching summary update in the same call, so the two never disagree outside a crash.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::descriptor::SynthesisDescriptor;
use crate::error::CacheError;
use crate::idle::{BackgroundScheduler, IdleScheduler, ImmediateScheduler};
use crate::key::{derive_key, key_for_meta, CacheKey};
use crate::limits::{CacheConfig, CacheLimits};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::store::{
    ClipMeta, ClipRecord, ClipStorage, Fetch, MemoryStorage, NullStorage, SqliteStorage,
    UpsertOutcome, LIMITS_SLOT,
};
use crate::summary::{CacheSummary, SummaryDelta, SummaryTracker};
use crate::synth::{SynthesisError, Synthesizer};

/// How long the background idle loop lets foreground work settle before a job runs.
const IDLE_SETTLE: Duration = Duration::from_millis(250);

pub(crate) struct CacheInner {
    pub(crate) storage: Arc<dyn ClipStorage>,
    pub(crate) summary: SummaryTracker,
    pub(crate) limits: watch::Sender<CacheLimits>,
    pub(crate) scheduler: Arc<dyn IdleScheduler>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: Arc<MetricsRegistry>,
    pub(crate) prune_pending: AtomicBool,
}

impl CacheInner {
    pub(crate) fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    pub(crate) fn current_limits(&self) -> CacheLimits {
        *self.limits.borrow()
    }

    pub(crate) async fn ensure_summary(&self, now_ms: i64) {
        self.summary.ensure_loaded(self.storage.as_ref(), now_ms).await;
    }

    pub(crate) async fn record_delta(&self, delta: SummaryDelta, now_ms: i64) {
        self.summary.record(self.storage.as_ref(), delta, now_ms).await;
    }
}

/// Shared handle to the clip cache. Cloning is cheap.
#[derive(Clone)]
pub struct ClipCache {
    pub(crate) inner: Arc<CacheInner>,
}

pub struct CacheBuilder {
    storage: Arc<dyn ClipStorage>,
    scheduler: Option<Arc<dyn IdleScheduler>>,
    clock: Option<Arc<dyn Clock>>,
    limits: Option<CacheLimits>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl CacheBuilder {
    pub fn new(storage: Arc<dyn ClipStorage>) -> Self {
        Self {
            storage,
            scheduler: None,
            clock: None,
            limits: None,
            metrics: None,
        }
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn IdleScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Explicit limits; they replace whatever was persisted.
    pub fn limits(mut self, limits: CacheLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn build(self) -> Result<ClipCache, CacheError> {
        let limits = match self.limits {
            Some(limits) => {
                limits.validate()?;
                persist_limits(self.storage.as_ref(), &limits).await;
                limits
            }
            None => load_limits(self.storage.as_ref()).await,
        };
        let (limits_tx, _rx) = watch::channel(limits);

        Ok(ClipCache {
            inner: Arc::new(CacheInner {
                storage: self.storage,
                summary: SummaryTracker::new(),
                limits: limits_tx,
                scheduler: self
                    .scheduler
                    .unwrap_or_else(|| Arc::new(ImmediateScheduler)),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                metrics: self.metrics.unwrap_or_default(),
                prune_pending: AtomicBool::new(false),
            }),
        })
    }
}

async fn load_limits(storage: &dyn ClipStorage) -> CacheLimits {
    let stored = match storage.read_slot(LIMITS_SLOT).await {
        Ok(Some(json)) => serde_json::from_str::<CacheLimits>(&json).ok(),
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "limits slot unreadable, using defaults");
            None
        }
    };
    match stored {
        Some(limits) if limits.validate().is_ok() => limits,
        Some(limits) => {
            warn!(?limits, "persisted limits invalid, using defaults");
            CacheLimits::default()
        }
        None => CacheLimits::default(),
    }
}

async fn persist_limits(storage: &dyn ClipStorage, limits: &CacheLimits) {
    match serde_json::to_string(limits) {
        Ok(json) => {
            if let Err(e) = storage.write_slot(LIMITS_SLOT, &json).await {
                warn!(error = %e, "limits persist failed");
            }
        }
        Err(e) => warn!(error = %e, "limits encode failed"),
    }
}

/// Summary change implied by an upsert of `new_bytes`.
fn upsert_delta(outcome: &UpsertOutcome, new_bytes: u64) -> SummaryDelta {
    if !outcome.stored {
        return SummaryDelta::default();
    }
    let mut delta = SummaryDelta::added(new_bytes);
    if let Some(old) = outcome.replaced_bytes {
        delta += SummaryDelta::removed(old);
    }
    for (_, bytes) in &outcome.removed_duplicates {
        delta += SummaryDelta::removed(*bytes);
    }
    delta
}

impl ClipCache {
    pub fn builder(storage: Arc<dyn ClipStorage>) -> CacheBuilder {
        CacheBuilder::new(storage)
    }

    /// Open the cache described by `config`. A database that cannot be opened
    /// degrades to an always-miss cache instead of failing.
    pub async fn open(config: &CacheConfig) -> Result<Self, CacheError> {
        let storage: Arc<dyn ClipStorage> = match &config.db_path {
            Some(path) => match SqliteStorage::open(path) {
                Ok(storage) => Arc::new(storage),
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "clip store unavailable, caching disabled");
                    Arc::new(NullStorage)
                }
            },
            None => Arc::new(MemoryStorage::new()),
        };

        let mut builder = CacheBuilder::new(storage)
            .scheduler(Arc::new(BackgroundScheduler::spawn(IDLE_SETTLE)));
        if let Some(limits) = config.explicit_limits() {
            builder = builder.limits(limits);
        }
        builder.build().await
    }

    /// False when running on the no-op store.
    pub fn is_available(&self) -> bool {
        self.inner.storage.is_available()
    }

    /// Cached clip for `key`, touching its access time. Expired clips are removed and
    /// reported absent. Storage failures read as a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<ClipRecord> {
        let inner = &self.inner;
        let now = inner.now();
        inner.ensure_summary(now).await;

        let span = inner.metrics.span(metric_names::CACHE_GET);
        let ttl_ms = inner.current_limits().ttl_ms();
        let found = match inner.storage.fetch(key, now, ttl_ms).await {
            Ok(Fetch::Hit(record)) => {
                debug!(key = %key, bytes = record.meta.bytes, "clip cache hit");
                Some(record)
            }
            Ok(Fetch::Expired { bytes }) => {
                debug!(key = %key, "clip expired");
                inner.record_delta(SummaryDelta::removed(bytes), now).await;
                None
            }
            Ok(Fetch::Miss) => {
                debug!(key = %key, "clip cache miss");
                None
            }
            Err(e) => {
                warn!(error = %e, key = %key, "clip lookup failed");
                None
            }
        };
        span.finish();
        found
    }

    /// [`ClipCache::get`] by descriptor.
    pub async fn lookup(&self, descriptor: &SynthesisDescriptor) -> Option<ClipRecord> {
        self.get(&derive_key(descriptor)).await
    }

    /// Store `payload` for `descriptor`. Rewrites keep the original creation time unless
    /// the old record had already expired, and
    /// records that are semantic duplicates of this one are removed. Always schedules a
    /// prune pass afterwards.
    pub async fn put(
        &self,
        descriptor: &SynthesisDescriptor,
        payload: Vec<u8>,
    ) -> Result<CacheKey, CacheError> {
        let meta = descriptor.resolve();
        if meta.text.is_empty() {
            return Err(CacheError::EmptyText);
        }
        if payload.is_empty() {
            return Err(CacheError::EmptyPayload);
        }

        let inner = &self.inner;
        let now = inner.now();
        inner.ensure_summary(now).await;

        let span = inner.metrics.span(metric_names::CACHE_PUT);
        let key = key_for_meta(&meta);
        let bytes = payload.len() as u64;
        let ttl_ms = inner.current_limits().ttl_ms();
        let result = inner
            .storage
            .upsert(ClipRecord::new(key.clone(), meta, payload, now), ttl_ms)
            .await;

        let result = match result {
            Ok(outcome) => {
                if !outcome.removed_duplicates.is_empty() {
                    debug!(
                        key = %key,
                        removed = outcome.removed_duplicates.len(),
                        "replaced semantically equivalent clips"
                    );
                }
                inner.record_delta(upsert_delta(&outcome, bytes), now).await;
                Ok(key)
            }
            Err(e) => {
                warn!(error = %e, key = %key, "clip write failed");
                Err(e.into())
            }
        };
        span.finish();
        self.request_prune();
        result
    }

    /// Remove `key`. Returns whether a record was actually removed.
    pub async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let inner = &self.inner;
        let now = inner.now();
        inner.ensure_summary(now).await;
        match inner.storage.delete(key).await? {
            Some(bytes) => {
                inner.record_delta(SummaryDelta::removed(bytes), now).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Metadata of every record, least recently accessed first. No payloads.
    pub async fn list_metadata(&self) -> Result<Vec<ClipMeta>, CacheError> {
        Ok(self.inner.storage.list_metadata().await?)
    }

    /// Remove every record and reset the summary to zero.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let inner = &self.inner;
        let now = inner.now();
        inner.ensure_summary(now).await;
        inner.storage.clear().await?;
        inner.summary.reset(now);
        inner.summary.persist(inner.storage.as_ref()).await;
        info!("clip cache cleared");
        Ok(())
    }

    /// Existence check that does not touch access time. A record past the age limit
    /// reports absent, as it would for `get`, but is left for the next prune.
    pub async fn has(&self, key: &CacheKey) -> bool {
        let inner = &self.inner;
        let ttl_ms = inner.current_limits().ttl_ms();
        match inner.storage.contains(key, inner.now(), ttl_ms).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, key = %key, "clip existence check failed");
                false
            }
        }
    }

    pub async fn summary(&self) -> CacheSummary {
        let inner = &self.inner;
        inner.ensure_summary(inner.now()).await;
        inner.summary.snapshot()
    }

    /// Observe summary changes without polling.
    pub fn subscribe(&self) -> watch::Receiver<CacheSummary> {
        self.inner.summary.subscribe()
    }

    /// Recompute the summary from a full scan of the store.
    pub async fn reconcile(&self) -> Result<CacheSummary, CacheError> {
        let inner = &self.inner;
        let now = inner.now();
        inner.ensure_summary(now).await;
        Ok(inner.summary.reconcile(inner.storage.as_ref(), now).await?)
    }

    pub fn limits(&self) -> CacheLimits {
        self.inner.current_limits()
    }

    /// Validate, persist and broadcast new limits, then schedule a prune pass.
    pub async fn set_limits(&self, limits: CacheLimits) -> Result<(), CacheError> {
        limits.validate()?;
        persist_limits(self.inner.storage.as_ref(), &limits).await;
        self.inner.limits.send_replace(limits);
        info!(
            max_entries = limits.max_entries,
            max_bytes = limits.max_bytes,
            ttl_secs = limits.ttl_secs,
            "cache limits updated"
        );
        self.request_prune();
        Ok(())
    }

    pub fn subscribe_limits(&self) -> watch::Receiver<CacheLimits> {
        self.inner.limits.subscribe()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.inner.metrics
    }

    /// Live narration path: cached payload if present, otherwise synthesize and write
    /// back. A failed write-back is logged and the fresh payload still returned.
    pub async fn fetch_or_synthesize(
        &self,
        descriptor: &SynthesisDescriptor,
        synthesizer: &dyn Synthesizer,
    ) -> Result<Vec<u8>, SynthesisError> {
        if let Some(record) = self.lookup(descriptor).await {
            return Ok(record.payload);
        }

        let span = self.inner.metrics.span(metric_names::SYNTHESIZE);
        let payload = synthesizer.synthesize(descriptor).await?;
        span.finish();

        if let Err(e) = self.put(descriptor, payload.clone()).await {
            warn!(error = %e, "caching synthesized clip failed, continuing uncached");
        }
        Ok(payload)
    }

    /// Insert a record only if its key is absent. Used by archive import.
    pub(crate) async fn insert_if_absent(&self, record: ClipRecord) -> Result<bool, CacheError> {
        let inner = &self.inner;
        let now = inner.now();
        inner.ensure_summary(now).await;
        let bytes = record.meta.bytes;
        let inserted = inner.storage.insert_if_absent(record).await?;
        if inserted {
            inner.record_delta(SummaryDelta::added(bytes), now).await;
        }
        Ok(inserted)
    }

    /// Read a record without touching it. Used by archive export.
    pub(crate) async fn load(&self, key: &CacheKey) -> Result<Option<ClipRecord>, CacheError> {
        Ok(self.inner.storage.load(key).await?)
    }

    pub(crate) fn now(&self) -> i64 {
        self.inner.now()
    }

    pub(crate) fn idle_scheduler(&self) -> Arc<dyn IdleScheduler> {
        Arc::clone(&self.inner.scheduler)
    }
}
