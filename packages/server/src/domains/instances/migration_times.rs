//! Migration attempt timestamps, used by the failed-migration cooldown.
//!
//! Every failed migration attempt stamps `instanceId -> ISO timestamp` in the
//! `migration-times` cache (TTL 7 days). The failed-migration sweep only
//! re-migrates an instance once the cooldown has elapsed since its stamp; a
//! successful re-migration refreshes the stamp.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::kernel::cache::Cache;

#[derive(Clone)]
pub struct MigrationTimeStore {
    cache: Arc<Cache>,
}

impl MigrationTimeStore {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    /// Stamp the latest migration attempt for an instance.
    pub async fn record(&self, instance_id: &str) -> Result<()> {
        self.cache.set(instance_id, &Utc::now()).await
    }

    pub async fn last_attempt(&self, instance_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.cache.get(instance_id).await
    }

    /// Whether the cooldown since the last recorded attempt has elapsed.
    /// An instance without a stamp has no pending cooldown.
    pub async fn cooldown_elapsed(&self, instance_id: &str, cooldown: Duration) -> Result<bool> {
        match self.last_attempt(instance_id).await? {
            None => Ok(true),
            Some(at) => {
                let elapsed = Utc::now().signed_duration_since(at);
                Ok(elapsed.num_milliseconds() >= cooldown.as_millis() as i64)
            }
        }
    }

    pub async fn clear(&self, instance_id: &str) -> Result<bool> {
        self.cache.delete(instance_id).await
    }
}
