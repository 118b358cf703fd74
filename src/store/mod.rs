//! Clip storage capability.
//! Every method is one atomic unit against the backing store; cache-level logic
//! (summary upkeep, pruning, expiry policy) lives in `ClipCache`, not here.

pub mod memory;
pub mod null;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use null::NullStorage;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::DescriptorMeta;
use crate::key::{equivalence_digest, CacheKey};

/// Slot holding the persisted [`crate::summary::CacheSummary`].
pub const SUMMARY_SLOT: &str = "summary";
/// Slot holding the persisted [`crate::limits::CacheLimits`].
pub const LIMITS_SLOT: &str = "limits";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("slot codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Clip metadata without the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipMeta {
    pub key: CacheKey,
    pub bytes: u64,
    pub created_at_ms: i64,
    pub last_access_ms: i64,
    pub descriptor: DescriptorMeta,
}

impl ClipMeta {
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.created_at_ms)
    }

    pub fn is_expired(&self, now_ms: i64, ttl_ms: i64) -> bool {
        self.age_ms(now_ms) > ttl_ms
    }
}

/// A stored clip: metadata plus audio payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipRecord {
    pub meta: ClipMeta,
    pub payload: Vec<u8>,
}

impl ClipRecord {
    pub fn new(key: CacheKey, descriptor: DescriptorMeta, payload: Vec<u8>, now_ms: i64) -> Self {
        Self {
            meta: ClipMeta {
                key,
                bytes: payload.len() as u64,
                created_at_ms: now_ms,
                last_access_ms: now_ms,
                descriptor,
            },
            payload,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.meta.key
    }

    pub(crate) fn equivalence(&self) -> String {
        equivalence_digest(&self.meta.descriptor)
    }
}

/// Outcome of a keyed lookup that touches or expires the record.
#[derive(Debug)]
pub enum Fetch {
    Hit(ClipRecord),
    /// The record was past its age limit and has been deleted.
    Expired { bytes: u64 },
    Miss,
}

/// What an upsert changed, so the caller can adjust the summary.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// False when the backend discarded the write (unavailable storage).
    pub stored: bool,
    /// Byte length of the record previously held under the same key.
    pub replaced_bytes: Option<u64>,
    /// Other keys removed as semantic duplicates, with their byte lengths.
    pub removed_duplicates: Vec<(CacheKey, u64)>,
}

#[async_trait]
pub trait ClipStorage: Send + Sync {
    /// False for the no-op backend used when no durable store could be opened.
    fn is_available(&self) -> bool {
        true
    }

    /// Look up `key`. If its age exceeds `ttl_ms` it is deleted and reported expired,
    /// otherwise its last-access time is set to `now_ms`.
    async fn fetch(&self, key: &CacheKey, now_ms: i64, ttl_ms: i64) -> Result<Fetch, StorageError>;

    /// Read a record without touching its access time.
    async fn load(&self, key: &CacheKey) -> Result<Option<ClipRecord>, StorageError>;

    /// Write `record`, preserving the creation time of any record already held under
    /// its key unless that record is older than `ttl_ms`, and remove other records with
    /// the same equivalence digest.
    async fn upsert(&self, record: ClipRecord, ttl_ms: i64) -> Result<UpsertOutcome, StorageError>;

    /// Write `record` only if its key is not present. Returns whether it was written.
    async fn insert_if_absent(&self, record: ClipRecord) -> Result<bool, StorageError>;

    /// Remove `key`, returning the byte length of what was removed.
    async fn delete(&self, key: &CacheKey) -> Result<Option<u64>, StorageError>;

    /// Whether `key` holds a record still within `ttl_ms`. Never touches access time
    /// and never deletes.
    async fn contains(&self, key: &CacheKey, now_ms: i64, ttl_ms: i64) -> Result<bool, StorageError>;

    /// All record metadata, least recently accessed first.
    async fn list_metadata(&self) -> Result<Vec<ClipMeta>, StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;

    async fn read_slot(&self, name: &str) -> Result<Option<String>, StorageError>;

    async fn write_slot(&self, name: &str, value: &str) -> Result<(), StorageError>;
}
