//! Startup monitoring.
//!
//! One provider check per job execution. Continuation is a fresh delayed
//! `MonitorInstance` job rather than an in-process loop, so a process restart
//! picks up exactly where the watch left off.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use super::classify_provider_error;
use crate::common::WebhookPayload;
use crate::config::DefaultsConfig;
use crate::domains::instances::models::InstanceStatus;
use crate::domains::instances::store::InstanceStore;
use crate::kernel::jobs::{
    Job, JobHandler, JobPayload, JobPriority, MonitorInstancePayload, RedisJobQueue,
    SendWebhookPayload,
};
use crate::kernel::traits::BaseProviderClient;

pub struct MonitorInstanceHandler {
    store: InstanceStore,
    provider: Arc<dyn BaseProviderClient>,
    queue: Arc<RedisJobQueue>,
    poll_interval: Duration,
}

impl MonitorInstanceHandler {
    pub fn new(
        store: InstanceStore,
        provider: Arc<dyn BaseProviderClient>,
        queue: Arc<RedisJobQueue>,
        defaults: DefaultsConfig,
    ) -> Self {
        Self {
            store,
            provider,
            queue,
            poll_interval: Duration::from_millis(defaults.poll_interval_ms),
        }
    }

    async fn enqueue_webhook(&self, payload: &MonitorInstancePayload, webhook: WebhookPayload) {
        let Some(url) = &payload.webhook_url else {
            return;
        };
        let job = JobPayload::SendWebhook(SendWebhookPayload {
            url: url.clone(),
            payload: webhook,
            headers: None,
        });
        if let Err(e) = self.queue.add(job, JobPriority::High, None).await {
            warn!(instance_id = %payload.instance_id, error = %e, "failed to enqueue webhook");
        }
    }

    async fn check(&self, payload: &MonitorInstancePayload) -> Result<()> {
        let elapsed_ms = Utc::now()
            .signed_duration_since(payload.start_time)
            .num_milliseconds();

        if elapsed_ms > payload.max_wait_time_ms as i64 {
            let message = format!(
                "Instance startup timeout after {}ms",
                payload.max_wait_time_ms
            );
            if let Some(mut state) = self.store.load(&payload.instance_id).await? {
                state.mark_failed(&message);
                self.store.save(&state).await?;
            }
            warn!(instance_id = %payload.instance_id, elapsed_ms, "{}", message);
            self.enqueue_webhook(
                payload,
                WebhookPayload::new(&payload.instance_id, "timeout").with_error(message),
            )
            .await;
            return Ok(());
        }

        let instance = self
            .provider
            .get_instance(&payload.novita_instance_id)
            .await
            .map_err(classify_provider_error)?;

        let mut state = self.store.load(&payload.instance_id).await?;
        if let Some(state) = state.as_mut() {
            state.absorb_provider(&instance);
        }

        match InstanceStatus::from_provider(&instance.status) {
            InstanceStatus::Running => {
                if let Some(mut state) = state {
                    state.status = InstanceStatus::Running;
                    state.timestamps.ready = Some(Utc::now());
                    state.last_error = None;
                    self.store.save(&state).await?;
                }
                info!(instance_id = %payload.instance_id, elapsed_ms, "instance is running");
                self.enqueue_webhook(
                    payload,
                    WebhookPayload::new(&payload.instance_id, "running").with_data(
                        serde_json::json!({ "novitaInstanceId": payload.novita_instance_id }),
                    ),
                )
                .await;
                Ok(())
            }
            InstanceStatus::Failed => {
                let message = "Instance failed during startup".to_string();
                if let Some(mut state) = state {
                    state.mark_failed(&message);
                    self.store.save(&state).await?;
                }
                self.enqueue_webhook(
                    payload,
                    WebhookPayload::new(&payload.instance_id, "failed").with_error(&message),
                )
                .await;
                // Throw so the queue records the failure against this job.
                bail!("{}", message);
            }
            _ => {
                if let Some(state) = state {
                    self.store.save(&state).await?;
                }
                // Not there yet: schedule the next check as a fresh job.
                self.queue
                    .add_delayed(
                        JobPayload::MonitorInstance(payload.clone()),
                        JobPriority::High,
                        None,
                        self.poll_interval,
                    )
                    .await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl JobHandler for MonitorInstanceHandler {
    async fn execute(&self, job: &Job) -> Result<()> {
        let JobPayload::MonitorInstance(payload) = &job.payload else {
            bail!("MonitorInstance handler received mismatched payload");
        };
        self.check(payload).await
    }
}
