//! Startup sync: cache reconciliation under the advisory lock.

use std::sync::Arc;
use std::time::Duration;

use novita_client::InstanceData;
use server_core::domains::instances::{InstanceState, InstanceStore, StartupSync};
use server_core::kernel::cache::CacheManager;
use server_core::kernel::kv_store::KvStore;
use server_core::kernel::{MemoryKvStore, MockProviderClient};

fn setup() -> (
    Arc<MemoryKvStore>,
    Arc<MockProviderClient>,
    InstanceStore,
    StartupSync,
) {
    let kv = Arc::new(MemoryKvStore::new());
    let caches = Arc::new(CacheManager::new(kv.clone()));
    let provider = Arc::new(MockProviderClient::new());
    let store = InstanceStore::new(caches.instances().clone());
    let sync = StartupSync::new(
        kv.clone(),
        provider.clone(),
        store.clone(),
    );
    (kv, provider, store, sync)
}

fn provider_instance(id: &str, status: &str) -> InstanceData {
    InstanceData {
        id: id.to_string(),
        name: format!("{}-name", id),
        status: status.to_string(),
        gpu_ids: None,
        spot_status: None,
        spot_reclaim_time: None,
    }
}

#[tokio::test]
async fn test_sync_updates_and_deletes() {
    let (kv, provider, store, sync) = setup();

    provider.add_instance(provider_instance("nov-1", "running"));
    provider.add_instance(provider_instance("nov-2", "exited"));

    // A cached state matching nov-1, plus an orphan the provider forgot.
    let mut known = InstanceState::new("inst_1", "one");
    known.novita_instance_id = Some("nov-1".to_string());
    store.save(&known).await.unwrap();

    let mut orphan = InstanceState::new("inst_2", "two");
    orphan.novita_instance_id = Some("nov-gone".to_string());
    store.save(&orphan).await.unwrap();

    let result = sync.run().await;
    assert!(!result.skipped);
    assert_eq!(result.synced, 2);
    assert_eq!(result.deleted, 1);
    assert!(result.errors.is_empty());

    // The known instance kept its id and absorbed the provider status.
    let state = store.load("inst_1").await.unwrap().unwrap();
    assert_eq!(
        state.status,
        server_core::domains::instances::InstanceStatus::Running
    );

    // The provider-only instance was materialized; the orphan is gone.
    assert!(store.load("nov-2").await.unwrap().is_some());
    assert!(store.load("inst_2").await.unwrap().is_none());

    // The last-sync stamp was written.
    assert!(kv.get("sync:startup:last").await.unwrap().is_some());
}

#[tokio::test]
async fn test_sync_skips_when_lock_is_held() {
    let (kv, provider, store, sync) = setup();
    provider.add_instance(provider_instance("nov-1", "running"));

    // Another process holds the lock.
    assert!(kv
        .set_nx(
            "sync:startup:lock",
            b"\"other\"".to_vec(),
            Duration::from_secs(300)
        )
        .await
        .unwrap());

    let result = sync.run().await;
    assert!(result.skipped);
    assert_eq!(result.synced, 0);
    assert!(store.load("nov-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_sync_releases_lock_after_run() {
    let (kv, provider, _store, sync) = setup();
    provider.add_instance(provider_instance("nov-1", "running"));

    let result = sync.run().await;
    assert!(!result.skipped);

    // The lock is free again for the next boot.
    assert!(kv.get("sync:startup:lock").await.unwrap().is_none());
    let second = sync.run().await;
    assert!(!second.skipped);
}

#[tokio::test]
async fn test_sync_survives_provider_failure() {
    let (_kv, provider, _store, sync) = setup();
    provider.set_list_error(novita_client::NovitaError::ServerError {
        status: 503,
        message: "unavailable".to_string(),
    });

    // Sync must never fail the boot; the failure surfaces in the result.
    let result = sync.run().await;
    assert!(!result.errors.is_empty());
    assert_eq!(result.synced, 0);
}

#[tokio::test]
async fn test_creation_in_flight_is_not_orphaned() {
    let (_kv, provider, store, sync) = setup();
    provider.add_instance(provider_instance("nov-1", "running"));

    // No provider id yet: creation still in flight, must survive the sync.
    let pending = InstanceState::new("inst_pending", "pending");
    store.save(&pending).await.unwrap();

    let result = sync.run().await;
    assert_eq!(result.deleted, 0);
    assert!(store.load("inst_pending").await.unwrap().is_some());
}
