//! A named TTL cache persisted in Redis.
//!
//! Reads are checked for lazy expiry; access statistics are batched in memory
//! and written back by a background flusher (see [`Cache::flush_access_stats`])
//! so a read does not cost a write. Size measurement is cached for 30 seconds
//! and refreshed every N sets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheMetrics, CacheMetricsSnapshot};
use crate::kernel::codec;
use crate::kernel::kv_store::{KvStore, PipelineCommand, PipelineReply};

const SCAN_BATCH: usize = 100;
const SIZE_CACHE_WINDOW_MS: i64 = 30_000;
const SIZE_REFRESH_EVERY_SETS: u64 = 10;
const DEFAULT_BULK_BATCH: usize = 30;

/// Outcome of a bulk operation; per-item errors are collected, not raised.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub ok: usize,
    pub errors: Vec<String>,
}

/// Pending access-stat update for one key.
#[derive(Debug, Clone, Copy)]
struct PendingAccess {
    delta: u64,
    last_accessed_at: DateTime<Utc>,
}

/// A named TTL cache over the KV store.
pub struct Cache {
    kv: Arc<dyn KvStore>,
    name: String,
    prefix: String,
    default_ttl: Duration,
    max_size: usize,
    metrics: CacheMetrics,
    /// In-memory last-access index used for LRU eviction decisions.
    lru: Mutex<HashMap<String, DateTime<Utc>>>,
    /// Batched access-stat increments awaiting writeback.
    pending_access: Mutex<HashMap<String, PendingAccess>>,
    /// Cached size measurement: (value, measured_at_ms).
    size_cache: Mutex<(u64, i64)>,
    sets_since_size_refresh: AtomicU64,
}

impl Cache {
    pub fn new(kv: Arc<dyn KvStore>, name: &str, default_ttl: Duration, max_size: usize) -> Self {
        Self {
            kv,
            name: name.to_string(),
            prefix: format!("cache:{}:", name),
            default_ttl,
            max_size,
            metrics: CacheMetrics::default(),
            lru: Mutex::new(HashMap::new()),
            pending_access: Mutex::new(HashMap::new()),
            size_cache: Mutex::new((0, 0)),
            sets_since_size_refresh: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Fetch a value. Expired entries are treated as absent and deleted in the
    /// background.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let full_key = self.full_key(key);
        let Some(bytes) = self.kv.get(&full_key).await? else {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let entry: CacheEntry = match codec::decode(&bytes) {
            Ok(entry) => entry,
            // Legacy record without the entry envelope (bare string or raw
            // document): tolerate it and rewrite the canonical form right
            // away, keeping the key's remaining TTL.
            Err(decode_err) => match codec::decode_tolerant::<serde_json::Value>(&bytes) {
                Ok(value) => {
                    let entry = CacheEntry::new(value, self.default_ttl.as_millis() as u64);
                    let remaining = self
                        .kv
                        .ttl(&full_key)
                        .await?
                        .unwrap_or(self.default_ttl);
                    self.kv
                        .set(&full_key, codec::encode(&entry)?, Some(remaining))
                        .await?;
                    debug!(cache = %self.name, key = %key, "rewrote legacy entry in canonical form");
                    entry
                }
                Err(_) => {
                    warn!(cache = %self.name, key = %key, error = %decode_err,
                        "dropping undecodable cache entry");
                    self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                    self.delete_in_background(full_key);
                    return Ok(None);
                }
            },
        };

        let now = Utc::now();
        if entry.is_expired(now) {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            self.delete_in_background(full_key);
            self.lru.lock().unwrap().remove(key);
            return Ok(None);
        }

        // Record the access in memory; the flusher writes it back later.
        {
            let mut pending = self.pending_access.lock().unwrap();
            let slot = pending.entry(key.to_string()).or_insert(PendingAccess {
                delta: 0,
                last_accessed_at: now,
            });
            slot.delta += 1;
            slot.last_accessed_at = now;
        }
        self.lru.lock().unwrap().insert(key.to_string(), now);

        self.metrics.hits.fetch_add(1, Ordering::Relaxed);
        let value = serde_json::from_value(entry.data)?;
        Ok(Some(value))
    }

    /// Store a value with the cache's default TTL.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set_with_ttl(key, value, self.default_ttl).await
    }

    /// Store a value with an explicit TTL.
    pub async fn set_with_ttl<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let is_new = !self.lru.lock().unwrap().contains_key(key);
        if is_new && self.size().await? as usize >= self.max_size {
            self.evict_lru().await;
        }

        let entry = CacheEntry::new(serde_json::to_value(value)?, ttl.as_millis() as u64);
        let bytes = codec::encode(&entry)?;
        self.kv.set(&self.full_key(key), bytes, Some(ttl)).await?;

        self.lru
            .lock()
            .unwrap()
            .insert(key.to_string(), entry.created_at);
        self.metrics.sets.fetch_add(1, Ordering::Relaxed);

        let sets = self.sets_since_size_refresh.fetch_add(1, Ordering::Relaxed) + 1;
        if sets >= SIZE_REFRESH_EVERY_SETS {
            self.sets_since_size_refresh.store(0, Ordering::Relaxed);
            if let Err(e) = self.refresh_size().await {
                debug!(cache = %self.name, error = %e, "size refresh failed");
            }
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.kv.del(&self.full_key(key)).await?;
        self.lru.lock().unwrap().remove(key);
        self.pending_access.lock().unwrap().remove(key);
        if existed {
            self.metrics.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(existed)
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.kv.exists(&self.full_key(key)).await
    }

    /// Enumerate all (unexpired or not) keys in this cache's namespace.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let pattern = format!("{}*", self.prefix);
        let mut cursor = 0u64;
        loop {
            let (next, batch) = self.kv.scan(cursor, &pattern, SCAN_BATCH).await?;
            for key in batch {
                // SCAN patterns are glob-matched server-side; keep a defensive
                // prefix check so a malformed pattern cannot leak foreign keys.
                if let Some(stripped) = key.strip_prefix(&self.prefix) {
                    keys.push(stripped.to_string());
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    /// Number of keys currently in the namespace, cached for 30 seconds.
    pub async fn size(&self) -> Result<u64> {
        {
            let cached = self.size_cache.lock().unwrap();
            let age = Utc::now().timestamp_millis() - cached.1;
            if cached.1 != 0 && age < SIZE_CACHE_WINDOW_MS {
                return Ok(cached.0);
            }
        }
        self.refresh_size().await
    }

    async fn refresh_size(&self) -> Result<u64> {
        let size = self.keys().await?.len() as u64;
        *self.size_cache.lock().unwrap() = (size, Utc::now().timestamp_millis());
        self.metrics.total_size.store(size, Ordering::Relaxed);
        Ok(size)
    }

    /// Evict the least-recently-used key known to this process.
    async fn evict_lru(&self) {
        let victim = {
            let lru = self.lru.lock().unwrap();
            lru.iter()
                .min_by_key(|(_, at)| **at)
                .map(|(key, _)| key.clone())
        };
        if let Some(key) = victim {
            debug!(cache = %self.name, key = %key, "evicting LRU entry");
            if let Err(e) = self.kv.del(&self.full_key(&key)).await {
                warn!(cache = %self.name, key = %key, error = %e, "LRU eviction delete failed");
            }
            self.lru.lock().unwrap().remove(&key);
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Delete expired entries in SCAN batches. Returns the number removed.
    pub async fn cleanup(&self) -> Result<usize> {
        let keys = self.keys().await?;
        let now = Utc::now();
        let mut removed = 0;

        for chunk in keys.chunks(SCAN_BATCH) {
            let gets: Vec<PipelineCommand> = chunk
                .iter()
                .map(|key| PipelineCommand::Get {
                    key: self.full_key(key),
                })
                .collect();
            let replies = self.kv.pipeline(gets).await?;

            let mut expired = Vec::new();
            for (key, reply) in chunk.iter().zip(replies) {
                if let Ok(PipelineReply::Value(Some(bytes))) = reply {
                    match codec::decode::<CacheEntry>(&bytes) {
                        Ok(entry) if entry.is_expired(now) => expired.push(key.clone()),
                        Ok(_) => {}
                        // Legacy records are tolerated, not collected; only
                        // entries unreadable even tolerantly are garbage.
                        Err(_) => {
                            if codec::decode_tolerant::<serde_json::Value>(&bytes).is_err() {
                                expired.push(key.clone());
                            }
                        }
                    }
                }
            }

            for key in expired {
                if self.kv.del(&self.full_key(&key)).await.unwrap_or(false) {
                    removed += 1;
                    self.lru.lock().unwrap().remove(&key);
                }
            }
        }

        if removed > 0 {
            debug!(cache = %self.name, removed, "cache cleanup removed expired entries");
        }
        Ok(removed)
    }

    /// Write pending access statistics back to Redis, preserving each entry's
    /// remaining TTL. Called by the manager's background flusher every 5s.
    pub async fn flush_access_stats(&self) -> Result<usize> {
        let pending: HashMap<String, PendingAccess> =
            std::mem::take(&mut *self.pending_access.lock().unwrap());
        if pending.is_empty() {
            return Ok(0);
        }

        let mut writes = Vec::with_capacity(pending.len());
        for (key, access) in &pending {
            let full_key = self.full_key(key);
            let Some(bytes) = self.kv.get(&full_key).await? else {
                continue; // expired or deleted since the read
            };
            let Ok(mut entry) = codec::decode::<CacheEntry>(&bytes) else {
                continue;
            };
            entry.access_count += access.delta;
            entry.last_accessed_at = access.last_accessed_at;

            let remaining = self.kv.ttl(&full_key).await?;
            writes.push(PipelineCommand::Set {
                key: full_key,
                value: codec::encode(&entry)?,
                ttl: remaining,
            });
        }

        let flushed = writes.len();
        if flushed > 0 {
            let results = self.kv.pipeline(writes).await?;
            for result in results {
                if let Err(e) = result {
                    warn!(cache = %self.name, error = %e, "access-stat writeback failed");
                }
            }
        }
        Ok(flushed)
    }

    // =========================================================================
    // Bulk operations (startup sync)
    // =========================================================================

    /// Set many entries, pipelined in independent batches.
    pub async fn bulk_set(
        &self,
        items: Vec<(String, serde_json::Value)>,
        ttl: Duration,
        batch_size: Option<usize>,
    ) -> BulkOutcome {
        let batch_size = batch_size.unwrap_or(DEFAULT_BULK_BATCH);
        let mut outcome = BulkOutcome::default();

        for chunk in items.chunks(batch_size) {
            let mut commands = Vec::with_capacity(chunk.len());
            for (key, value) in chunk {
                let entry = CacheEntry::new(value.clone(), ttl.as_millis() as u64);
                match codec::encode(&entry) {
                    Ok(bytes) => commands.push(PipelineCommand::Set {
                        key: self.full_key(key),
                        value: bytes,
                        ttl: Some(ttl),
                    }),
                    Err(e) => outcome.errors.push(format!("{}: {}", key, e)),
                }
            }

            match self.kv.pipeline(commands).await {
                Ok(results) => {
                    for (result, (key, _)) in results.iter().zip(chunk) {
                        match result {
                            Ok(_) => {
                                outcome.ok += 1;
                                self.lru.lock().unwrap().insert(key.clone(), Utc::now());
                            }
                            Err(e) => outcome.errors.push(format!("{}: {}", key, e)),
                        }
                    }
                    self.metrics
                        .sets
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
                // Batches are independent; a failed batch only loses its own items.
                Err(e) => outcome
                    .errors
                    .push(format!("batch of {} failed: {}", chunk.len(), e)),
            }
        }
        outcome
    }

    /// Delete many keys, pipelined in independent batches.
    pub async fn bulk_delete(&self, keys: &[String], batch_size: Option<usize>) -> BulkOutcome {
        let batch_size = batch_size.unwrap_or(DEFAULT_BULK_BATCH);
        let mut outcome = BulkOutcome::default();

        for chunk in keys.chunks(batch_size) {
            let commands: Vec<PipelineCommand> = chunk
                .iter()
                .map(|key| PipelineCommand::Del {
                    key: self.full_key(key),
                })
                .collect();

            match self.kv.pipeline(commands).await {
                Ok(results) => {
                    for (result, key) in results.iter().zip(chunk) {
                        match result {
                            Ok(_) => {
                                outcome.ok += 1;
                                self.lru.lock().unwrap().remove(key);
                            }
                            Err(e) => outcome.errors.push(format!("{}: {}", key, e)),
                        }
                    }
                    self.metrics
                        .deletes
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
                Err(e) => outcome
                    .errors
                    .push(format!("batch of {} failed: {}", chunk.len(), e)),
            }
        }
        outcome
    }

    /// Check existence of many keys in one pipeline per batch.
    pub async fn bulk_exists(&self, keys: &[String]) -> Result<Vec<(String, bool)>> {
        let mut results = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(DEFAULT_BULK_BATCH) {
            let commands: Vec<PipelineCommand> = chunk
                .iter()
                .map(|key| PipelineCommand::Exists {
                    key: self.full_key(key),
                })
                .collect();
            let replies = self.kv.pipeline(commands).await?;
            for (key, reply) in chunk.iter().zip(replies) {
                let exists = matches!(reply, Ok(PipelineReply::Bool(true)));
                results.push((key.clone(), exists));
            }
        }
        Ok(results)
    }

    /// Fetch many raw entries in one pipeline per batch. Expired entries come
    /// back as `None`.
    pub async fn bulk_get(&self, keys: &[String]) -> Result<Vec<(String, Option<serde_json::Value>)>> {
        let now = Utc::now();
        let mut results = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(DEFAULT_BULK_BATCH) {
            let commands: Vec<PipelineCommand> = chunk
                .iter()
                .map(|key| PipelineCommand::Get {
                    key: self.full_key(key),
                })
                .collect();
            let replies = self.kv.pipeline(commands).await?;
            for (key, reply) in chunk.iter().zip(replies) {
                let value = match reply {
                    Ok(PipelineReply::Value(Some(bytes))) => match codec::decode::<CacheEntry>(
                        &bytes,
                    ) {
                        Ok(entry) if !entry.is_expired(now) => Some(entry.data),
                        Ok(_) => None,
                        // Legacy record; the next update rewrites it canonically.
                        Err(_) => codec::decode_tolerant::<serde_json::Value>(&bytes).ok(),
                    },
                    _ => None,
                };
                results.push((key.clone(), value));
            }
        }
        Ok(results)
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn delete_in_background(&self, full_key: String) {
        let kv = self.kv.clone();
        tokio::spawn(async move {
            if let Err(e) = kv.del(&full_key).await {
                debug!(key = %full_key, error = %e, "background delete of expired entry failed");
            }
        });
    }
}
