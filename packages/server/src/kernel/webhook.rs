//! Webhook delivery over HTTP.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use super::traits::BaseWebhookSender;
use crate::common::WebhookPayload;

/// Reqwest-backed webhook sender with a short delivery timeout.
pub struct WebhookClient {
    client: reqwest::Client,
}

impl WebhookClient {
    pub fn new(timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BaseWebhookSender for WebhookClient {
    async fn send(
        &self,
        url: &str,
        payload: &WebhookPayload,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<()> {
        let mut request = self.client.post(url).json(payload);
        if let Some(headers) = headers {
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("webhook POST to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            // Non-2xx is a retryable failure; the queue re-delivers.
            bail!("webhook POST to {} returned {}", url, status);
        }

        tracing::debug!(url = %url, status = %payload.status, "webhook delivered");
        Ok(())
    }
}
