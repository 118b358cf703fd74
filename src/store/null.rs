//! Store used when no durable backend is available: every lookup misses,
//! every write is discarded. Narration keeps working, just uncached.

use async_trait::async_trait;

use super::{ClipMeta, ClipRecord, ClipStorage, Fetch, StorageError, UpsertOutcome};
use crate::key::CacheKey;

#[derive(Debug, Default, Clone, Copy)]
pub struct NullStorage;

#[async_trait]
impl ClipStorage for NullStorage {
    fn is_available(&self) -> bool {
        false
    }

    async fn fetch(&self, _key: &CacheKey, _now_ms: i64, _ttl_ms: i64) -> Result<Fetch, StorageError> {
        Ok(Fetch::Miss)
    }

    async fn load(&self, _key: &CacheKey) -> Result<Option<ClipRecord>, StorageError> {
        Ok(None)
    }

    async fn upsert(&self, _record: ClipRecord, _ttl_ms: i64) -> Result<UpsertOutcome, StorageError> {
        Ok(UpsertOutcome::default())
    }

    async fn insert_if_absent(&self, _record: ClipRecord) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn delete(&self, _key: &CacheKey) -> Result<Option<u64>, StorageError> {
        Ok(None)
    }

    async fn contains(&self, _key: &CacheKey, _now_ms: i64, _ttl_ms: i64) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn list_metadata(&self) -> Result<Vec<ClipMeta>, StorageError> {
        Ok(Vec::new())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn read_slot(&self, _name: &str) -> Result<Option<String>, StorageError> {
        Ok(None)
    }

    async fn write_slot(&self, _name: &str, _value: &str) -> Result<(), StorageError> {
        Ok(())
    }
}
