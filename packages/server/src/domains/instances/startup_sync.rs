//! Boot-time reconciliation of the instance cache against the provider.
//!
//! Runs under a Redis advisory lock so only one process syncs per window.
//! The provider list is authoritative: every provider instance is written
//! back (fresh TTL), and cached instances the provider no longer knows are
//! deleted. Sync never fails the boot; problems come back in the result.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::listing::list_all_provider_instances;
use super::models::InstanceState;
use super::store::InstanceStore;
use crate::kernel::codec;
use crate::kernel::kv_store::KvStore;
use crate::kernel::traits::BaseProviderClient;

const LOCK_KEY: &str = "sync:startup:lock";
const LAST_SYNC_KEY: &str = "sync:startup:last";
const LOCK_TTL: Duration = Duration::from_secs(300);
const LAST_SYNC_TTL: Duration = Duration::from_secs(24 * 3600);
const SYNC_ENTRY_TTL: Duration = Duration::from_secs(300);
const BULK_BATCH: usize = 30;

#[derive(Debug, Default, Serialize)]
pub struct SyncResult {
    pub synced: usize,
    pub deleted: usize,
    /// True when another process held the lock and this one did nothing.
    pub skipped: bool,
    pub errors: Vec<String>,
}

pub struct StartupSync {
    kv: Arc<dyn KvStore>,
    provider: Arc<dyn BaseProviderClient>,
    store: InstanceStore,
}

impl StartupSync {
    pub fn new(
        kv: Arc<dyn KvStore>,
        provider: Arc<dyn BaseProviderClient>,
        store: InstanceStore,
    ) -> Self {
        Self {
            kv,
            provider,
            store,
        }
    }

    /// Run the sync. Never returns an error; failures are carried in the
    /// result so startup proceeds regardless.
    pub async fn run(&self) -> SyncResult {
        match self.sync().await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "startup sync failed");
                SyncResult {
                    errors: vec![e.to_string()],
                    ..Default::default()
                }
            }
        }
    }

    async fn sync(&self) -> Result<SyncResult> {
        let owner = Uuid::new_v4().to_string();
        let acquired = self
            .kv
            .set_nx(LOCK_KEY, codec::encode(&owner)?, LOCK_TTL)
            .await?;
        if !acquired {
            info!("startup sync lock held elsewhere, skipping");
            return Ok(SyncResult {
                skipped: true,
                ..Default::default()
            });
        }

        let result = self.sync_locked().await;
        if let Err(e) = self.kv.del(LOCK_KEY).await {
            warn!(error = %e, "failed to release startup sync lock");
        }
        result
    }

    async fn sync_locked(&self) -> Result<SyncResult> {
        let mut result = SyncResult::default();

        let provider_instances = list_all_provider_instances(self.provider.as_ref()).await?;
        let provider_ids: HashSet<&str> = provider_instances
            .iter()
            .map(|instance| instance.id.as_str())
            .collect();

        // Index cached states by their provider id for the merge.
        let cached = self.store.all().await?;
        let mut by_provider_id: HashMap<String, InstanceState> = cached
            .iter()
            .filter_map(|state| {
                state
                    .novita_instance_id
                    .clone()
                    .map(|id| (id, state.clone()))
            })
            .collect();

        let mut updates = Vec::with_capacity(provider_instances.len());
        for instance in &provider_instances {
            let state = match by_provider_id.remove(&instance.id) {
                Some(mut state) => {
                    state.absorb_provider(instance);
                    state
                }
                None => InstanceState::from_provider(instance),
            };
            updates.push((state.id.clone(), serde_json::to_value(&state)?));
        }

        // Cached instances the provider no longer reports. States without a
        // provider id are creations in flight and are left alone.
        let orphaned: Vec<String> = cached
            .iter()
            .filter(|state| {
                state
                    .novita_instance_id
                    .as_deref()
                    .map(|id| !provider_ids.contains(id))
                    .unwrap_or(false)
            })
            .map(|state| state.id.clone())
            .collect();

        let set_outcome = self
            .store
            .cache()
            .bulk_set(updates, SYNC_ENTRY_TTL, Some(BULK_BATCH))
            .await;
        result.synced = set_outcome.ok;
        result.errors.extend(set_outcome.errors);

        if !orphaned.is_empty() {
            let delete_outcome = self
                .store
                .cache()
                .bulk_delete(&orphaned, Some(BULK_BATCH))
                .await;
            result.deleted = delete_outcome.ok;
            result.errors.extend(delete_outcome.errors);
        }

        let stamp = serde_json::json!({ "timestamp": Utc::now() });
        self.kv
            .set(LAST_SYNC_KEY, codec::encode(&stamp)?, Some(LAST_SYNC_TTL))
            .await?;

        info!(
            synced = result.synced,
            deleted = result.deleted,
            errors = result.errors.len(),
            "startup sync finished"
        );
        Ok(result)
    }
}
