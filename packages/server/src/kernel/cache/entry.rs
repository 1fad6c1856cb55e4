//! Cache entry and metrics types.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single cached value with access bookkeeping.
///
/// `data` is kept as a raw JSON document so the access-stat flusher can
/// rewrite entries without knowing the concrete type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: serde_json::Value,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "ttlMs")]
    pub ttl_ms: u64,
    #[serde(rename = "accessCount")]
    pub access_count: u64,
    #[serde(rename = "lastAccessedAt")]
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(data: serde_json::Value, ttl_ms: u64) -> Self {
        let now = Utc::now();
        Self {
            data,
            created_at: now,
            ttl_ms,
            access_count: 0,
            last_accessed_at: now,
        }
    }

    /// Lazy expiry check against the entry's own clock.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.num_milliseconds() > self.ttl_ms as i64
    }
}

/// Lock-free counters for one named cache.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub evictions: AtomicU64,
    pub total_size: AtomicU64,
}

impl CacheMetrics {
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            total_size: self.total_size.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of cache metrics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub total_size: u64,
}

impl CacheMetricsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiry() {
        let mut entry = CacheEntry::new(serde_json::json!({"v": 1}), 1_000);
        let now = Utc::now();
        assert!(!entry.is_expired(now));

        entry.created_at = now - chrono::Duration::milliseconds(1_001);
        assert!(entry.is_expired(now));
    }

    #[test]
    fn test_hit_ratio() {
        let metrics = CacheMetrics::default();
        metrics.hits.store(9, Ordering::Relaxed);
        metrics.misses.store(1, Ordering::Relaxed);
        let snap = metrics.snapshot();
        assert!((snap.hit_ratio() - 0.9).abs() < f64::EPSILON);

        let empty = CacheMetrics::default().snapshot();
        assert_eq!(empty.hit_ratio(), 0.0);
    }
}
