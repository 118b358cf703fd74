//! Durable clip store backed by SQLite.
//! One `clips` row per cache key with denormalized descriptor fields, an index on
//! last access for eviction order and an index on the equivalence digest for dedup.
//! Summary and limits live in the small `slots` table.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, info};

use super::{ClipMeta, ClipRecord, ClipStorage, Fetch, StorageError, UpsertOutcome};
use crate::descriptor::DescriptorMeta;
use crate::key::CacheKey;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS clips (
        cache_key TEXT PRIMARY KEY,
        bytes INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        last_access INTEGER NOT NULL,
        text TEXT NOT NULL,
        lang TEXT NOT NULL,
        voice TEXT NOT NULL,
        model TEXT NOT NULL,
        flavor TEXT NOT NULL,
        rate REAL NOT NULL,
        pitch REAL NOT NULL,
        format TEXT NOT NULL,
        sample_rate INTEGER,
        equivalence TEXT NOT NULL,
        payload BLOB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_clips_access ON clips(last_access);
    CREATE INDEX IF NOT EXISTS idx_clips_equivalence ON clips(equivalence);
    CREATE TABLE IF NOT EXISTS slots (
        name TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );";

const META_COLUMNS: &str = "cache_key, bytes, created_at, last_access, text, lang, voice, \
                            model, flavor, rate, pitch, format, sample_rate";

/// SQLite-backed clip store.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) the clip database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let storage = Self::with_connection(conn)?;
        info!(path = %db_path.display(), "clip store opened");
        Ok(storage)
    }

    /// Private in-memory database, mostly for tests and ephemeral hosts.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn meta_from_row(row: &Row<'_>) -> rusqlite::Result<ClipMeta> {
    Ok(ClipMeta {
        key: CacheKey::from_raw(row.get::<_, String>(0)?),
        bytes: row.get::<_, i64>(1)?.max(0) as u64,
        created_at_ms: row.get(2)?,
        last_access_ms: row.get(3)?,
        descriptor: DescriptorMeta {
            text: row.get(4)?,
            lang: row.get(5)?,
            voice: row.get(6)?,
            model: row.get(7)?,
            flavor: row.get(8)?,
            rate: row.get::<_, f64>(9)? as f32,
            pitch: row.get::<_, f64>(10)? as f32,
            format: row.get(11)?,
            sample_rate: row.get(12)?,
        },
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ClipRecord> {
    Ok(ClipRecord {
        meta: meta_from_row(row)?,
        payload: row.get(13)?,
    })
}

fn select_record(tx: &Transaction<'_>, key: &CacheKey) -> rusqlite::Result<Option<ClipRecord>> {
    tx.query_row(
        &format!("SELECT {META_COLUMNS}, payload FROM clips WHERE cache_key = ?1"),
        params![key.as_str()],
        record_from_row,
    )
    .optional()
}

fn write_record(tx: &Transaction<'_>, record: &ClipRecord, created_at: i64) -> rusqlite::Result<()> {
    let meta = &record.meta;
    let d = &meta.descriptor;
    tx.execute(
        "INSERT OR REPLACE INTO clips
         (cache_key, bytes, created_at, last_access, text, lang, voice, model, flavor,
          rate, pitch, format, sample_rate, equivalence, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            meta.key.as_str(),
            record.payload.len() as i64,
            created_at,
            meta.last_access_ms,
            d.text,
            d.lang,
            d.voice,
            d.model,
            d.flavor,
            f64::from(d.rate),
            f64::from(d.pitch),
            d.format,
            d.sample_rate,
            record.equivalence(),
            record.payload,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl ClipStorage for SqliteStorage {
    async fn fetch(&self, key: &CacheKey, now_ms: i64, ttl_ms: i64) -> Result<Fetch, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let Some(mut record) = select_record(&tx, key)? else {
            return Ok(Fetch::Miss);
        };

        if record.meta.is_expired(now_ms, ttl_ms) {
            tx.execute("DELETE FROM clips WHERE cache_key = ?1", params![key.as_str()])?;
            tx.commit()?;
            debug!(key = %key, "expired clip removed on read");
            return Ok(Fetch::Expired {
                bytes: record.meta.bytes,
            });
        }

        tx.execute(
            "UPDATE clips SET last_access = ?2 WHERE cache_key = ?1",
            params![key.as_str(), now_ms],
        )?;
        tx.commit()?;
        record.meta.last_access_ms = now_ms;
        Ok(Fetch::Hit(record))
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<ClipRecord>, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Ok(select_record(&tx, key)?)
    }

    async fn upsert(&self, record: ClipRecord, ttl_ms: i64) -> Result<UpsertOutcome, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let key = record.key().as_str();

        let existing: Option<(i64, i64)> = tx
            .query_row(
                "SELECT created_at, bytes FROM clips WHERE cache_key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let duplicates: Vec<(String, i64)> = {
            let mut stmt = tx.prepare_cached(
                "SELECT cache_key, bytes FROM clips WHERE equivalence = ?1 AND cache_key <> ?2",
            )?;
            let rows = stmt.query_map(params![record.equivalence(), key], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for (dup, _) in &duplicates {
            tx.execute("DELETE FROM clips WHERE cache_key = ?1", params![dup])?;
        }

        let now_ms = record.meta.created_at_ms;
        let created_at = existing
            .map(|(created, _)| created)
            .filter(|&created| now_ms.saturating_sub(created) <= ttl_ms)
            .unwrap_or(now_ms);
        write_record(&tx, &record, created_at)?;
        tx.commit()?;

        Ok(UpsertOutcome {
            stored: true,
            replaced_bytes: existing.map(|(_, bytes)| bytes.max(0) as u64),
            removed_duplicates: duplicates
                .into_iter()
                .map(|(k, bytes)| (CacheKey::from_raw(k), bytes.max(0) as u64))
                .collect(),
        })
    }

    async fn insert_if_absent(&self, record: ClipRecord) -> Result<bool, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let exists = tx
            .query_row(
                "SELECT 1 FROM clips WHERE cache_key = ?1",
                params![record.key().as_str()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Ok(false);
        }
        write_record(&tx, &record, record.meta.created_at_ms)?;
        tx.commit()?;
        Ok(true)
    }

    async fn delete(&self, key: &CacheKey) -> Result<Option<u64>, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let bytes: Option<i64> = tx
            .query_row(
                "SELECT bytes FROM clips WHERE cache_key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if bytes.is_some() {
            tx.execute("DELETE FROM clips WHERE cache_key = ?1", params![key.as_str()])?;
            tx.commit()?;
        }
        Ok(bytes.map(|b| b.max(0) as u64))
    }

    async fn contains(&self, key: &CacheKey, now_ms: i64, ttl_ms: i64) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        let created_at: Option<i64> = conn
            .query_row(
                "SELECT created_at FROM clips WHERE cache_key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(created_at.is_some_and(|created| now_ms.saturating_sub(created) <= ttl_ms))
    }

    async fn list_metadata(&self) -> Result<Vec<ClipMeta>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {META_COLUMNS} FROM clips ORDER BY last_access ASC, created_at ASC, cache_key ASC"
        ))?;
        let rows = stmt.query_map([], meta_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM clips", [])?;
        info!(removed, "clip store cleared");
        Ok(())
    }

    async fn read_slot(&self, name: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM slots WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn write_slot(&self, name: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO slots (name, value) VALUES (?1, ?2)",
            params![name, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::SynthesisDescriptor;
    use crate::key::derive_key;

    fn record(text: &str, rate: f32, payload: &[u8], now: i64) -> ClipRecord {
        let descriptor = SynthesisDescriptor::new(text).with_rate(rate);
        ClipRecord::new(derive_key(&descriptor), descriptor.resolve(), payload.to_vec(), now)
    }

    #[tokio::test]
    async fn upsert_preserves_creation_time() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let first = record("Nice work", 1.0, b"aaaa", 1_000);
        let key = first.key().clone();
        store.upsert(first, i64::MAX).await.unwrap();

        let outcome = store.upsert(record("Nice work", 1.0, b"bb", 5_000), i64::MAX).await.unwrap();
        assert_eq!(outcome.replaced_bytes, Some(4));

        let loaded = store.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.meta.created_at_ms, 1_000);
        assert_eq!(loaded.meta.last_access_ms, 5_000);
        assert_eq!(loaded.payload, b"bb");
    }

    #[tokio::test]
    async fn upsert_over_expired_record_restarts_age() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let first = record("Nice work", 1.0, b"aaaa", 1_000);
        let key = first.key().clone();
        store.upsert(first, 3_000).await.unwrap();

        store.upsert(record("Nice work", 1.0, b"bb", 5_000), 3_000).await.unwrap();
        let loaded = store.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.meta.created_at_ms, 5_000);
        assert!(store.contains(&key, 5_000, 3_000).await.unwrap());
    }

    #[tokio::test]
    async fn upsert_drops_equivalent_records() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let slow = record("Nice work", 0.8, b"slow", 1_000);
        let slow_key = slow.key().clone();
        store.upsert(slow, i64::MAX).await.unwrap();

        let outcome = store.upsert(record("NICE work", 1.2, b"fast", 2_000), i64::MAX).await.unwrap();
        assert_eq!(outcome.removed_duplicates, vec![(slow_key.clone(), 4)]);
        assert!(!store.contains(&slow_key, 2_000, i64::MAX).await.unwrap());
        assert_eq!(store.list_metadata().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fetch_touches_or_expires() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let clip = record("Count with me", 1.0, b"123", 1_000);
        let key = clip.key().clone();
        store.upsert(clip, i64::MAX).await.unwrap();

        match store.fetch(&key, 2_000, 10_000).await.unwrap() {
            Fetch::Hit(hit) => assert_eq!(hit.meta.last_access_ms, 2_000),
            other => panic!("expected hit, got {other:?}"),
        }
        assert!(matches!(
            store.fetch(&key, 20_000, 10_000).await.unwrap(),
            Fetch::Expired { bytes: 3 }
        ));
        assert!(matches!(store.fetch(&key, 20_000, 10_000).await.unwrap(), Fetch::Miss));
    }

    #[tokio::test]
    async fn slots_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clips.db");
        {
            let store = SqliteStorage::open(&path).unwrap();
            store.write_slot("summary", "{\"entryCount\":3}").await.unwrap();
            store.upsert(record("Ready?", 1.0, b"go", 10), i64::MAX).await.unwrap();
        }
        let reopened = SqliteStorage::open(&path).unwrap();
        assert_eq!(
            reopened.read_slot("summary").await.unwrap().as_deref(),
            Some("{\"entryCount\":3}")
        );
        assert_eq!(reopened.list_metadata().await.unwrap().len(), 1);
    }
}
