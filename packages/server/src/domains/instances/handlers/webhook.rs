//! Webhook delivery job.
//!
//! Delivery is at-least-once: any failure propagates to the queue, which
//! retries with backoff until the attempt budget runs out.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::kernel::jobs::{Job, JobHandler, JobPayload};
use crate::kernel::traits::BaseWebhookSender;

pub struct SendWebhookHandler {
    sender: Arc<dyn BaseWebhookSender>,
}

impl SendWebhookHandler {
    pub fn new(sender: Arc<dyn BaseWebhookSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl JobHandler for SendWebhookHandler {
    async fn execute(&self, job: &Job) -> Result<()> {
        let JobPayload::SendWebhook(payload) = &job.payload else {
            bail!("SendWebhook handler received mismatched payload");
        };

        self.sender
            .send(&payload.url, &payload.payload, payload.headers.as_ref())
            .await?;

        debug!(url = %payload.url, instance_id = %payload.payload.instance_id,
            status = %payload.payload.status, "webhook job delivered");
        Ok(())
    }
}
