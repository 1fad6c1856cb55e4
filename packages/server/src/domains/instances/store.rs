//! Instance state persistence over the `instances` cache.

use std::sync::Arc;

use anyhow::Result;

use super::models::InstanceState;
use crate::kernel::cache::Cache;

/// Thin typed wrapper over the `instances` cache namespace.
#[derive(Clone)]
pub struct InstanceStore {
    cache: Arc<Cache>,
}

impl InstanceStore {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    pub async fn load(&self, instance_id: &str) -> Result<Option<InstanceState>> {
        self.cache.get(instance_id).await
    }

    pub async fn save(&self, state: &InstanceState) -> Result<()> {
        self.cache.set(&state.id, state).await
    }

    pub async fn delete(&self, instance_id: &str) -> Result<bool> {
        self.cache.delete(instance_id).await
    }

    pub async fn ids(&self) -> Result<Vec<String>> {
        self.cache.keys().await
    }

    /// Load every cached instance state, skipping expired or corrupt entries.
    pub async fn all(&self) -> Result<Vec<InstanceState>> {
        let ids = self.ids().await?;
        let entries = self.cache.bulk_get(&ids).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(_, value)| value)
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect())
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }
}
