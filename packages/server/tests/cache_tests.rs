//! Cache layer: TTL expiry, metrics, access-stat writeback, LRU, bulk ops.

use std::sync::Arc;
use std::time::Duration;

use server_core::kernel::cache::{Cache, CacheEntry};
use server_core::kernel::codec;
use server_core::kernel::kv_store::KvStore;
use server_core::kernel::MemoryKvStore;

fn cache(kv: Arc<MemoryKvStore>, ttl: Duration, max_size: usize) -> Cache {
    Cache::new(kv, "t", ttl, max_size)
}

#[tokio::test]
async fn test_set_then_get_within_ttl() {
    let kv = Arc::new(MemoryKvStore::new());
    let cache = cache(kv, Duration::from_secs(60), 100);

    cache.set("k", &"value".to_string()).await.unwrap();
    let got: Option<String> = cache.get("k").await.unwrap();
    assert_eq!(got.as_deref(), Some("value"));

    let metrics = cache.metrics();
    assert_eq!((metrics.hits, metrics.misses, metrics.sets), (1, 0, 1));
}

#[tokio::test]
async fn test_get_after_ttl_is_absent() {
    let kv = Arc::new(MemoryKvStore::new());
    let cache = cache(kv, Duration::from_millis(30), 100);

    cache.set("k", &42i64).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let got: Option<i64> = cache.get("k").await.unwrap();
    assert!(got.is_none());
    assert_eq!(cache.metrics().misses, 1);
}

#[tokio::test]
async fn test_delete_and_exists() {
    let kv = Arc::new(MemoryKvStore::new());
    let cache = cache(kv, Duration::from_secs(60), 100);

    cache.set("k", &1i64).await.unwrap();
    assert!(cache.exists("k").await.unwrap());
    assert!(cache.delete("k").await.unwrap());
    assert!(!cache.exists("k").await.unwrap());
    assert!(!cache.delete("k").await.unwrap());
    assert_eq!(cache.metrics().deletes, 1);
}

#[tokio::test]
async fn test_keys_only_sees_own_namespace() {
    let kv = Arc::new(MemoryKvStore::new());
    let mine = Cache::new(
        kv.clone(),
        "mine",
        Duration::from_secs(60),
        100,
    );
    let other = Cache::new(
        kv,
        "other",
        Duration::from_secs(60),
        100,
    );

    mine.set("a", &1i64).await.unwrap();
    other.set("b", &2i64).await.unwrap();

    let keys = mine.keys().await.unwrap();
    assert_eq!(keys, vec!["a".to_string()]);
}

#[tokio::test]
async fn test_access_stats_are_batched_and_flushed() {
    let kv = Arc::new(MemoryKvStore::new());
    let cache = Cache::new(
        kv.clone(),
        "t",
        Duration::from_secs(60),
        100,
    );

    cache.set("k", &"v".to_string()).await.unwrap();
    let _: Option<String> = cache.get("k").await.unwrap();
    let _: Option<String> = cache.get("k").await.unwrap();

    // Reads do not write back immediately.
    let raw = kv.get("cache:t:k").await.unwrap().unwrap();
    let entry: CacheEntry = codec::decode(&raw).unwrap();
    assert_eq!(entry.access_count, 0);

    // The flusher writes the batched increments, preserving TTL.
    let flushed = cache.flush_access_stats().await.unwrap();
    assert_eq!(flushed, 1);

    let raw = kv.get("cache:t:k").await.unwrap().unwrap();
    let entry: CacheEntry = codec::decode(&raw).unwrap();
    assert_eq!(entry.access_count, 2);
    let remaining = kv.ttl("cache:t:k").await.unwrap();
    assert!(remaining.is_some(), "writeback must preserve the TTL");

    // Nothing pending after a flush.
    assert_eq!(cache.flush_access_stats().await.unwrap(), 0);
}

#[tokio::test]
async fn test_lru_eviction_at_capacity() {
    let kv = Arc::new(MemoryKvStore::new());
    let cache = Cache::new(
        kv.clone(),
        "t",
        Duration::from_secs(60),
        5,
    );

    // Ten sets refresh the cached size measurement along the way.
    for i in 0..10 {
        cache.set(&format!("k{}", i), &i).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    // Touch k0 so it is no longer the least recently used.
    let _: Option<i64> = cache.get("k0").await.unwrap();

    cache.set("k10", &10i64).await.unwrap();

    let metrics = cache.metrics();
    assert!(metrics.evictions >= 1, "a new key at capacity must evict");
    // k1 was the least recently used once k0 was touched.
    assert!(!cache.exists("k1").await.unwrap());
    assert!(cache.exists("k0").await.unwrap());
}

#[tokio::test]
async fn test_legacy_string_record_is_tolerated_and_rewritten() {
    let kv = Arc::new(MemoryKvStore::new());
    let cache = Cache::new(
        kv.clone(),
        "t",
        Duration::from_secs(60),
        100,
    );

    // A record written before values carried the entry envelope: raw text.
    kv.set(
        "cache:t:legacy",
        b"running".to_vec(),
        Some(Duration::from_secs(60)),
    )
    .await
    .unwrap();

    // The read falls back to the string interpretation.
    let got: Option<String> = cache.get("legacy").await.unwrap();
    assert_eq!(got.as_deref(), Some("running"));
    assert_eq!(cache.metrics().hits, 1);

    // The canonical form was rewritten, with the key's TTL preserved.
    let raw = kv.get("cache:t:legacy").await.unwrap().unwrap();
    let entry: CacheEntry = codec::decode(&raw).unwrap();
    assert_eq!(entry.data, serde_json::json!("running"));
    assert!(kv.ttl("cache:t:legacy").await.unwrap().is_some());
}

#[tokio::test]
async fn test_bulk_get_tolerates_legacy_records() {
    let kv = Arc::new(MemoryKvStore::new());
    let cache = Cache::new(
        kv.clone(),
        "t",
        Duration::from_secs(60),
        100,
    );

    kv.set(
        "cache:t:legacy",
        b"old-value".to_vec(),
        Some(Duration::from_secs(60)),
    )
    .await
    .unwrap();
    cache.set("canonical", &"new-value".to_string()).await.unwrap();

    let keys = vec!["legacy".to_string(), "canonical".to_string()];
    let got = cache.bulk_get(&keys).await.unwrap();
    assert_eq!(got[0].1, Some(serde_json::json!("old-value")));
    assert_eq!(got[1].1, Some(serde_json::json!("new-value")));
}

#[tokio::test]
async fn test_cleanup_removes_logically_expired_entries() {
    let kv = Arc::new(MemoryKvStore::new());
    let cache = Cache::new(
        kv.clone(),
        "t",
        Duration::from_secs(60),
        100,
    );

    // Entries whose logical TTL expired but that are still physically
    // present (no key-level TTL set).
    let stale = CacheEntry::new(serde_json::json!("old"), 1);
    kv.set("cache:t:stale", codec::encode(&stale).unwrap(), None)
        .await
        .unwrap();
    cache.set("fresh", &"new".to_string()).await.unwrap();
    // A legacy record with no envelope must survive cleanup.
    kv.set("cache:t:legacy", b"keep me".to_vec(), None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    let removed = cache.cleanup().await.unwrap();
    assert_eq!(removed, 1);
    assert!(!cache.exists("stale").await.unwrap());
    assert!(cache.exists("fresh").await.unwrap());
    assert!(cache.exists("legacy").await.unwrap());
}

#[tokio::test]
async fn test_bulk_set_get_exists_delete() {
    let kv = Arc::new(MemoryKvStore::new());
    let cache = cache(kv, Duration::from_secs(60), 100);

    let items: Vec<(String, serde_json::Value)> = (0..7)
        .map(|i| (format!("k{}", i), serde_json::json!({ "n": i })))
        .collect();
    let outcome = cache
        .bulk_set(items, Duration::from_secs(60), Some(3))
        .await;
    assert_eq!(outcome.ok, 7);
    assert!(outcome.errors.is_empty());

    let keys: Vec<String> = (0..7).map(|i| format!("k{}", i)).collect();
    let exists = cache.bulk_exists(&keys).await.unwrap();
    assert!(exists.iter().all(|(_, present)| *present));

    let got = cache.bulk_get(&keys).await.unwrap();
    assert_eq!(got.len(), 7);
    assert!(got.iter().all(|(_, value)| value.is_some()));

    let outcome = cache.bulk_delete(&keys, Some(4)).await;
    assert_eq!(outcome.ok, 7);
    let exists = cache.bulk_exists(&keys).await.unwrap();
    assert!(exists.iter().all(|(_, present)| !present));
}

#[tokio::test]
async fn test_hit_ratio_reflects_traffic() {
    let kv = Arc::new(MemoryKvStore::new());
    let cache = cache(kv, Duration::from_secs(60), 100);

    cache.set("k", &1i64).await.unwrap();
    for _ in 0..9 {
        let _: Option<i64> = cache.get("k").await.unwrap();
    }
    let _: Option<i64> = cache.get("missing").await.unwrap();

    let metrics = cache.metrics();
    assert_eq!(metrics.hits, 9);
    assert_eq!(metrics.misses, 1);
    assert!((metrics.hit_ratio() - 0.9).abs() < f64::EPSILON);
}
