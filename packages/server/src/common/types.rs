//! Types shared between the kernel and domain layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body of an outgoing webhook notification.
///
/// Delivery is at-least-once; payloads are idempotent (receivers key on
/// `instance_id` + `status`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    /// One of "running", "failed", "timeout".
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookPayload {
    pub fn new(instance_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            status: status.into(),
            timestamp: Utc::now(),
            data: None,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}
