//! In-process clip store. LRU-ordered so least recently used records come out first.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use super::{ClipMeta, ClipRecord, ClipStorage, Fetch, StorageError, UpsertOutcome};
use crate::key::CacheKey;

struct StoredClip {
    record: ClipRecord,
    equivalence: String,
}

struct MemoryState {
    clips: LruCache<CacheKey, StoredClip>,
    by_equivalence: HashMap<String, HashSet<CacheKey>>,
    slots: HashMap<String, String>,
}

impl MemoryState {
    fn remove(&mut self, key: &CacheKey) -> Option<StoredClip> {
        let stored = self.clips.pop(key)?;
        if let Some(keys) = self.by_equivalence.get_mut(&stored.equivalence) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_equivalence.remove(&stored.equivalence);
            }
        }
        Some(stored)
    }

    fn insert(&mut self, record: ClipRecord) {
        let equivalence = record.equivalence();
        self.by_equivalence
            .entry(equivalence.clone())
            .or_default()
            .insert(record.key().clone());
        self.clips.put(
            record.key().clone(),
            StoredClip {
                record,
                equivalence,
            },
        );
    }
}

pub struct MemoryStorage {
    inner: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryState {
                clips: LruCache::unbounded(),
                by_equivalence: HashMap::new(),
                slots: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClipStorage for MemoryStorage {
    async fn fetch(&self, key: &CacheKey, now_ms: i64, ttl_ms: i64) -> Result<Fetch, StorageError> {
        let mut state = self.inner.lock();
        match state.clips.get_mut(key) {
            None => return Ok(Fetch::Miss),
            Some(stored) if !stored.record.meta.is_expired(now_ms, ttl_ms) => {
                stored.record.meta.last_access_ms = now_ms;
                return Ok(Fetch::Hit(stored.record.clone()));
            }
            Some(_) => {}
        }
        let bytes = state.remove(key).map(|s| s.record.meta.bytes).unwrap_or(0);
        Ok(Fetch::Expired { bytes })
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<ClipRecord>, StorageError> {
        let state = self.inner.lock();
        Ok(state.clips.peek(key).map(|s| s.record.clone()))
    }

    async fn upsert(&self, mut record: ClipRecord, ttl_ms: i64) -> Result<UpsertOutcome, StorageError> {
        let mut state = self.inner.lock();
        let key = record.key().clone();

        let duplicates: Vec<CacheKey> = state
            .by_equivalence
            .get(&record.equivalence())
            .map(|keys| keys.iter().filter(|k| **k != key).cloned().collect())
            .unwrap_or_default();
        let mut removed_duplicates = Vec::with_capacity(duplicates.len());
        for dup in duplicates {
            if let Some(stored) = state.remove(&dup) {
                removed_duplicates.push((dup, stored.record.meta.bytes));
            }
        }

        let replaced = state.remove(&key);
        if let Some(previous) = replaced
            .as_ref()
            .filter(|p| !p.record.meta.is_expired(record.meta.created_at_ms, ttl_ms))
        {
            record.meta.created_at_ms = previous.record.meta.created_at_ms;
        }
        record.meta.bytes = record.payload.len() as u64;
        state.insert(record);

        Ok(UpsertOutcome {
            stored: true,
            replaced_bytes: replaced.map(|s| s.record.meta.bytes),
            removed_duplicates,
        })
    }

    async fn insert_if_absent(&self, mut record: ClipRecord) -> Result<bool, StorageError> {
        let mut state = self.inner.lock();
        if state.clips.contains(record.key()) {
            return Ok(false);
        }
        record.meta.bytes = record.payload.len() as u64;
        state.insert(record);
        Ok(true)
    }

    async fn delete(&self, key: &CacheKey) -> Result<Option<u64>, StorageError> {
        let mut state = self.inner.lock();
        Ok(state.remove(key).map(|s| s.record.meta.bytes))
    }

    async fn contains(&self, key: &CacheKey, now_ms: i64, ttl_ms: i64) -> Result<bool, StorageError> {
        Ok(self
            .inner
            .lock()
            .clips
            .peek(key)
            .is_some_and(|s| !s.record.meta.is_expired(now_ms, ttl_ms)))
    }

    async fn list_metadata(&self) -> Result<Vec<ClipMeta>, StorageError> {
        let state = self.inner.lock();
        // LRU order breaks ties between records touched in the same millisecond.
        let mut metas: Vec<ClipMeta> = state
            .clips
            .iter()
            .rev()
            .map(|(_, s)| s.record.meta.clone())
            .collect();
        metas.sort_by_key(|m| m.last_access_ms);
        Ok(metas)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut state = self.inner.lock();
        state.clips.clear();
        state.by_equivalence.clear();
        Ok(())
    }

    async fn read_slot(&self, name: &str) -> Result<Option<String>, StorageError> {
        Ok(self.inner.lock().slots.get(name).cloned())
    }

    async fn write_slot(&self, name: &str, value: &str) -> Result<(), StorageError> {
        self.inner
            .lock()
            .slots
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}
