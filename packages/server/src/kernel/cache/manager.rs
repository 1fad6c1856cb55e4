//! Registry of the named caches and their background maintenance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::entry::CacheMetricsSnapshot;
use super::store::Cache;
use crate::kernel::kv_store::KvStore;
use crate::kernel::service_host::Service;

const ACCESS_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

const INSTANCES_TTL: Duration = Duration::from_secs(300);
const PRODUCTS_TTL: Duration = Duration::from_secs(300);
const TEMPLATES_TTL: Duration = Duration::from_secs(600);
const MIGRATION_TIMES_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

const DEFAULT_MAX_SIZE: usize = 1000;

/// All named caches, keyed by domain.
pub struct CacheManager {
    instances: Arc<Cache>,
    products: Arc<Cache>,
    templates: Arc<Cache>,
    migration_times: Arc<Cache>,
}

impl CacheManager {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            instances: Arc::new(Cache::new(
                kv.clone(),
                "instances",
                INSTANCES_TTL,
                DEFAULT_MAX_SIZE,
            )),
            products: Arc::new(Cache::new(
                kv.clone(),
                "products",
                PRODUCTS_TTL,
                DEFAULT_MAX_SIZE,
            )),
            templates: Arc::new(Cache::new(
                kv.clone(),
                "templates",
                TEMPLATES_TTL,
                DEFAULT_MAX_SIZE,
            )),
            migration_times: Arc::new(Cache::new(
                kv,
                "migration-times",
                MIGRATION_TIMES_TTL,
                DEFAULT_MAX_SIZE,
            )),
        }
    }

    pub fn instances(&self) -> &Arc<Cache> {
        &self.instances
    }

    pub fn products(&self) -> &Arc<Cache> {
        &self.products
    }

    pub fn templates(&self) -> &Arc<Cache> {
        &self.templates
    }

    pub fn migration_times(&self) -> &Arc<Cache> {
        &self.migration_times
    }

    fn all(&self) -> [&Arc<Cache>; 4] {
        [
            &self.instances,
            &self.products,
            &self.templates,
            &self.migration_times,
        ]
    }

    /// Flush pending access statistics for every cache.
    pub async fn flush_all(&self) {
        for cache in self.all() {
            if let Err(e) = cache.flush_access_stats().await {
                warn!(cache = %cache.name(), error = %e, "access-stat flush failed");
            }
        }
    }

    /// Remove expired entries from every cache.
    pub async fn cleanup_all(&self) {
        for cache in self.all() {
            match cache.cleanup().await {
                Ok(removed) if removed > 0 => {
                    debug!(cache = %cache.name(), removed, "cleanup pass")
                }
                Ok(_) => {}
                Err(e) => warn!(cache = %cache.name(), error = %e, "cleanup pass failed"),
            }
        }
    }

    /// Metrics per cache, keyed by cache name.
    pub fn metrics(&self) -> HashMap<String, CacheMetricsSnapshot> {
        self.all()
            .iter()
            .map(|cache| (cache.name().to_string(), cache.metrics()))
            .collect()
    }
}

/// Background service: periodic access-stat flush and expired-entry cleanup.
pub struct CacheMaintenance {
    manager: Arc<CacheManager>,
}

impl CacheMaintenance {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Service for CacheMaintenance {
    fn name(&self) -> &'static str {
        "cache-maintenance"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut flush = tokio::time::interval(ACCESS_FLUSH_INTERVAL);
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        flush.tick().await; // skip immediate ticks
        cleanup.tick().await;

        info!("cache maintenance started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = flush.tick() => self.manager.flush_all().await,
                _ = cleanup.tick() => self.manager.cleanup_all().await,
            }
        }

        // One final flush so batched access stats survive shutdown.
        self.manager.flush_all().await;
        info!("cache maintenance stopped");
        Ok(())
    }
}
