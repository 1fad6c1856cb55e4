//! Instance creation.
//!
//! Resolves the optimal product (with multi-region fallback) and the template
//! concurrently, provisions a spot instance through the provider, and hands
//! startup watching to a `MonitorInstance` job. Any failure marks the cached
//! state Failed, notifies the caller's webhook, and rethrows so the queue can
//! retry.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use novita_client::CreateInstanceRequest;
use tracing::{info, warn};

use super::classify_provider_error;
use crate::common::WebhookPayload;
use crate::domains::instances::models::{
    EnvSetting, InstanceConfiguration, InstanceState, InstanceStatus, PortMapping,
};
use crate::domains::instances::product_resolver::ProductResolver;
use crate::domains::instances::store::InstanceStore;
use crate::domains::instances::template_resolver::TemplateResolver;
use crate::kernel::jobs::{
    CreateInstancePayload, Job, JobHandler, JobPayload, JobPriority, MonitorInstancePayload,
    RedisJobQueue, SendWebhookPayload,
};
use crate::kernel::traits::BaseProviderClient;

/// Default budget for the startup watch.
const DEFAULT_MAX_WAIT_TIME_MS: u64 = 600_000;

pub struct CreateInstanceHandler {
    store: InstanceStore,
    products: Arc<ProductResolver>,
    templates: Arc<TemplateResolver>,
    provider: Arc<dyn BaseProviderClient>,
    queue: Arc<RedisJobQueue>,
}

impl CreateInstanceHandler {
    pub fn new(
        store: InstanceStore,
        products: Arc<ProductResolver>,
        templates: Arc<TemplateResolver>,
        provider: Arc<dyn BaseProviderClient>,
        queue: Arc<RedisJobQueue>,
    ) -> Self {
        Self {
            store,
            products,
            templates,
            provider,
            queue,
        }
    }

    async fn create(&self, payload: &CreateInstancePayload) -> Result<()> {
        // The state record is created synchronously at request time; tolerate
        // a missing one (expired cache) by rebuilding it from the payload.
        let mut state = self
            .store
            .load(&payload.instance_id)
            .await?
            .unwrap_or_else(|| InstanceState::new(&payload.instance_id, &payload.name));

        let ((product, region_used), template) = futures::try_join!(
            self.products
                .optimal_product_with_fallback(&payload.product_name, Some(&payload.region)),
            self.templates.resolve(&payload.template_id),
        )?;

        let image_auth = match &template.image_auth {
            Some(auth_id) => {
                let auth = self
                    .provider
                    .get_registry_auth(auth_id)
                    .await
                    .map_err(classify_provider_error)?;
                Some(format!("{}:{}", auth.username, auth.password))
            }
            None => None,
        };

        let ports = template
            .ports
            .iter()
            .map(|p| format!("{}/{}", p.port, p.port_type))
            .collect::<Vec<_>>()
            .join(",");

        let request = CreateInstanceRequest {
            name: payload.name.clone(),
            product_id: product.id.clone(),
            gpu_num: payload.gpu_num,
            rootfs_size: payload.rootfs_size,
            image_url: template.image_url.clone(),
            image_auth,
            ports,
            envs: template.envs.clone(),
            kind: "gpu".to_string(),
            billing_mode: "spot".to_string(),
        };

        let created = self
            .provider
            .create_instance(&request)
            .await
            .map_err(classify_provider_error)?;

        state.novita_instance_id = Some(created.id.clone());
        state.status = InstanceStatus::Starting;
        state.timestamps.started = Some(Utc::now());
        state.webhook_url = payload.webhook_url.clone();
        state.configuration = InstanceConfiguration {
            gpu_num: payload.gpu_num,
            rootfs_size: payload.rootfs_size,
            region: region_used.clone(),
            image_url: template.image_url.clone(),
            image_auth: template.image_auth.clone(),
            ports: template
                .ports
                .iter()
                .map(|p| PortMapping {
                    port: p.port,
                    port_type: p.port_type.clone(),
                })
                .collect(),
            envs: template
                .envs
                .iter()
                .map(|e| EnvSetting {
                    key: e.key.clone(),
                    value: e.value.clone(),
                })
                .collect(),
        };
        self.store.save(&state).await?;

        self.queue
            .add(
                JobPayload::MonitorInstance(MonitorInstancePayload {
                    instance_id: payload.instance_id.clone(),
                    novita_instance_id: created.id.clone(),
                    start_time: Utc::now(),
                    max_wait_time_ms: DEFAULT_MAX_WAIT_TIME_MS,
                    webhook_url: payload.webhook_url.clone(),
                }),
                JobPriority::High,
                None,
            )
            .await?;

        info!(
            instance_id = %payload.instance_id,
            novita_instance_id = %created.id,
            product_id = %product.id,
            region = %region_used,
            "instance created, monitoring startup"
        );
        Ok(())
    }

    async fn record_failure(&self, payload: &CreateInstancePayload, error: &anyhow::Error) {
        let mut state = match self.store.load(&payload.instance_id).await {
            Ok(Some(state)) => state,
            _ => InstanceState::new(&payload.instance_id, &payload.name),
        };
        state.mark_failed(error.to_string());
        if let Err(e) = self.store.save(&state).await {
            warn!(instance_id = %payload.instance_id, error = %e, "failed to persist failure state");
        }

        if let Some(url) = &payload.webhook_url {
            let webhook = JobPayload::SendWebhook(SendWebhookPayload {
                url: url.clone(),
                payload: WebhookPayload::new(&payload.instance_id, "failed")
                    .with_error(error.to_string()),
                headers: None,
            });
            if let Err(e) = self.queue.add(webhook, JobPriority::High, None).await {
                warn!(instance_id = %payload.instance_id, error = %e, "failed to enqueue failure webhook");
            }
        }
    }
}

#[async_trait]
impl JobHandler for CreateInstanceHandler {
    async fn execute(&self, job: &Job) -> Result<()> {
        let JobPayload::CreateInstance(payload) = &job.payload else {
            bail!("CreateInstance handler received mismatched payload");
        };

        match self.create(payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(instance_id = %payload.instance_id, error = %e, "instance creation failed");
                self.record_failure(payload, &e).await;
                // Rethrow so the queue applies its retry policy.
                Err(e)
            }
        }
    }
}
