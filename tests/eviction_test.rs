use std::sync::Arc;

use voxcache::limits::MIB;
use voxcache::{
    CacheKey, CacheLimits, ClipCache, ClipStorage, ManualClock, MemoryStorage, QueuedScheduler,
    SqliteStorage, SynthesisDescriptor,
};

const HOUR_MS: i64 = 3_600_000;

async fn cache_with(
    storage: Arc<dyn ClipStorage>,
    limits: CacheLimits,
) -> (ClipCache, Arc<ManualClock>, Arc<QueuedScheduler>) {
    let clock = Arc::new(ManualClock::new(1_000));
    let scheduler = Arc::new(QueuedScheduler::new());
    let cache = ClipCache::builder(storage)
        .clock(clock.clone())
        .scheduler(scheduler.clone())
        .limits(limits)
        .build()
        .await
        .unwrap();
    (cache, clock, scheduler)
}

fn limits(max_entries: u64, max_bytes: u64, ttl_secs: u64) -> CacheLimits {
    CacheLimits {
        max_entries,
        max_bytes,
        ttl_secs,
    }
}

async fn fill(cache: &ClipCache, clock: &ManualClock, count: usize, size: usize) -> Vec<CacheKey> {
    let mut keys = Vec::with_capacity(count);
    for i in 0..count {
        let descriptor = SynthesisDescriptor::new(format!("Count {i}"));
        keys.push(cache.put(&descriptor, vec![i as u8; size]).await.unwrap());
        clock.advance_ms(1);
    }
    keys
}

async fn live_keys(cache: &ClipCache) -> Vec<CacheKey> {
    let mut keys: Vec<_> = cache
        .list_metadata()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.key)
        .collect();
    keys.sort();
    keys
}

#[tokio::test]
async fn count_limit_keeps_most_recent() {
    for storage in [
        Arc::new(MemoryStorage::new()) as Arc<dyn ClipStorage>,
        Arc::new(SqliteStorage::open_in_memory().unwrap()),
    ] {
        let n = 5;
        let (cache, clock, scheduler) = cache_with(storage, limits(n, 64 * MIB, 3600)).await;
        let keys = fill(&cache, &clock, n as usize + 5, 10).await;

        // Puts coalesce into a single pending pass.
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.drain().await, 1);

        let mut expected = keys[5..].to_vec();
        expected.sort();
        assert_eq!(live_keys(&cache).await, expected);
        let summary = cache.summary().await;
        assert_eq!((summary.entry_count, summary.total_bytes), (5, 50));
    }
}

#[tokio::test]
async fn recent_access_protects_old_clip() {
    let (cache, clock, _) = cache_with(Arc::new(MemoryStorage::new()), limits(3, 64 * MIB, 3600)).await;
    let keys = fill(&cache, &clock, 3, 1).await;
    assert!(cache.get(&keys[0]).await.is_some());
    clock.advance_ms(1);
    let extra = cache.put(&SynthesisDescriptor::new("Extra"), vec![7]).await.unwrap();
    cache.prune().await.unwrap();

    let mut expected = vec![keys[0].clone(), keys[2].clone(), extra];
    expected.sort();
    assert_eq!(live_keys(&cache).await, expected);
}

#[tokio::test]
async fn byte_limit_evicts_oldest_first() {
    let (cache, clock, _) = cache_with(Arc::new(MemoryStorage::new()), limits(100, MIB, 3600)).await;
    let chunk = (MIB / 4) as usize;
    let keys = fill(&cache, &clock, 6, chunk).await;
    let report = cache.prune().await.unwrap();

    assert_eq!(report.removed, 2);
    assert_eq!(report.freed_bytes, 2 * chunk as u64);
    assert_eq!(report.remaining_bytes, MIB);
    let mut expected = keys[2..].to_vec();
    expected.sort();
    assert_eq!(live_keys(&cache).await, expected);
}

#[tokio::test]
async fn expired_clip_is_absent_and_uncounted() {
    let (cache, clock, _) = cache_with(Arc::new(MemoryStorage::new()), limits(100, 64 * MIB, 3600)).await;
    let keys = fill(&cache, &clock, 2, 8).await;
    assert_eq!(cache.summary().await.entry_count, 2);

    clock.advance_ms(HOUR_MS);
    assert!(cache.get(&keys[0]).await.is_none());
    let summary = cache.summary().await;
    assert_eq!((summary.entry_count, summary.total_bytes), (1, 8));

    let report = cache.prune().await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(cache.summary().await.entry_count, 0);
}

#[tokio::test]
async fn prune_is_idempotent() {
    let (cache, clock, _) = cache_with(Arc::new(MemoryStorage::new()), limits(2, 64 * MIB, 3600)).await;
    fill(&cache, &clock, 4, 1).await;
    assert_eq!(cache.prune().await.unwrap().removed, 2);
    assert_eq!(cache.prune().await.unwrap().removed, 0);
    assert_eq!(cache.summary().await.entry_count, 2);
}

#[tokio::test]
async fn lowering_limits_triggers_pass() {
    let (cache, clock, scheduler) = cache_with(Arc::new(MemoryStorage::new()), limits(10, 64 * MIB, 3600)).await;
    fill(&cache, &clock, 6, 1).await;
    scheduler.drain().await;
    assert_eq!(live_keys(&cache).await.len(), 6);

    cache.set_limits(limits(4, 64 * MIB, 3600)).await.unwrap();
    assert!(cache.prune_pending());
    scheduler.drain().await;
    assert_eq!(live_keys(&cache).await.len(), 4);
}

#[tokio::test]
async fn reconcile_repairs_drifted_summary() {
    let storage = Arc::new(MemoryStorage::new());
    let (cache, clock, _) = cache_with(storage.clone(), limits(100, 64 * MIB, 3600)).await;
    let keys = fill(&cache, &clock, 3, 4).await;

    // Mutate the store behind the cache's back.
    storage.delete(&keys[0]).await.unwrap();
    assert_eq!(cache.summary().await.entry_count, 3);

    let summary = cache.reconcile().await.unwrap();
    assert_eq!((summary.entry_count, summary.total_bytes), (2, 8));
    assert_eq!(cache.summary().await, summary);
}
