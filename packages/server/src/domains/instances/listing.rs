//! Full provider instance enumeration.
//!
//! The provider lists instances in pages; sweeps need the complete set, so we
//! walk all pages with a small gap between requests to stay friendly to the
//! provider's rate limits. When the listing fails and local fallback is
//! enabled, the cached instance set stands in (stale but better than an
//! aborted sweep).

use std::time::Duration;

use anyhow::{Context, Result};
use novita_client::InstanceData;
use tracing::{debug, warn};

use super::store::InstanceStore;
use crate::kernel::traits::BaseProviderClient;

const PAGE_SIZE: i64 = 50;
const PAGE_GAP: Duration = Duration::from_millis(100);

/// Fetch every instance from the provider, paginated.
pub async fn list_all_provider_instances(
    provider: &dyn BaseProviderClient,
) -> novita_client::Result<Vec<InstanceData>> {
    let mut instances = Vec::new();
    let mut page = 1;
    loop {
        let response = provider.list_instances(page, PAGE_SIZE, None).await?;
        let count = response.instances.len();
        instances.extend(response.instances);

        if count < PAGE_SIZE as usize || instances.len() as i64 >= response.total {
            break;
        }
        page += 1;
        tokio::time::sleep(PAGE_GAP).await;
    }
    debug!(total = instances.len(), "listed provider instances");
    Ok(instances)
}

/// Like [`list_all_provider_instances`], but falls back to the local cache
/// when enabled and the provider listing fails.
pub async fn list_instances_with_fallback(
    provider: &dyn BaseProviderClient,
    store: &InstanceStore,
    enable_fallback_to_local: bool,
) -> Result<Vec<InstanceData>> {
    match list_all_provider_instances(provider).await {
        Ok(instances) => Ok(instances),
        Err(e) if enable_fallback_to_local => {
            warn!(error = %e, "provider listing failed, falling back to local cache");
            let cached = store.all().await.context("local fallback listing failed")?;
            Ok(cached
                .into_iter()
                .filter_map(|state| {
                    state.novita_instance_id.clone().map(|id| InstanceData {
                        id,
                        name: state.name.clone(),
                        status: serde_json::to_value(state.status)
                            .ok()
                            .and_then(|v| v.as_str().map(str::to_string))
                            .unwrap_or_default(),
                        gpu_ids: state.gpu_ids.clone(),
                        spot_status: state.spot_status.clone(),
                        spot_reclaim_time: state.spot_reclaim_time.clone(),
                    })
                })
                .collect())
        }
        Err(e) => Err(e).context("provider listing failed"),
    }
}
