//! Instance state model.
//!
//! The cached copy of an instance; the authoritative copy is provider-side.
//! State is mutated only by the handler currently processing that instance's
//! id (the queue serializes handlers per job), so no per-instance locking is
//! needed.

use chrono::{DateTime, Utc};
use novita_client::InstanceData;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Creating,
    Starting,
    Running,
    Exited,
    Stopped,
    Failed,
}

impl InstanceStatus {
    /// Map a provider status string onto the internal lifecycle.
    pub fn from_provider(status: &str) -> Self {
        match status {
            "creating" => InstanceStatus::Creating,
            "starting" | "pulling" => InstanceStatus::Starting,
            "running" => InstanceStatus::Running,
            "exited" => InstanceStatus::Exited,
            "stopped" => InstanceStatus::Stopped,
            "failed" => InstanceStatus::Failed,
            other => {
                tracing::debug!(status = other, "unrecognized provider status, keeping Creating");
                InstanceStatus::Creating
            }
        }
    }
}

/// A port exposed by the instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub port: i64,
    #[serde(rename = "type")]
    pub port_type: String,
}

/// An environment variable passed to the instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvSetting {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InstanceConfiguration {
    #[serde(rename = "gpuNum")]
    pub gpu_num: i64,
    #[serde(rename = "rootfsSize")]
    pub rootfs_size: i64,
    pub region: String,
    #[serde(rename = "imageUrl")]
    pub image_url: String,
    #[serde(rename = "imageAuth", skip_serializing_if = "Option::is_none")]
    pub image_auth: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub envs: Vec<EnvSetting>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceTimestamps {
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<DateTime<Utc>>,
    #[serde(rename = "lastUsed", skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

impl Default for InstanceTimestamps {
    fn default() -> Self {
        Self {
            created: Utc::now(),
            started: None,
            ready: None,
            failed: None,
            last_used: None,
        }
    }
}

/// Cached instance state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    pub id: String,
    #[serde(rename = "novitaInstanceId", skip_serializing_if = "Option::is_none")]
    pub novita_instance_id: Option<String>,
    pub name: String,
    pub status: InstanceStatus,
    pub configuration: InstanceConfiguration,
    pub timestamps: InstanceTimestamps,
    #[serde(rename = "spotStatus", skip_serializing_if = "Option::is_none")]
    pub spot_status: Option<String>,
    #[serde(rename = "spotReclaimTime", skip_serializing_if = "Option::is_none")]
    pub spot_reclaim_time: Option<String>,
    #[serde(rename = "gpuIds", skip_serializing_if = "Option::is_none")]
    pub gpu_ids: Option<Vec<i64>>,
    #[serde(rename = "webhookUrl", skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl InstanceState {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            novita_instance_id: None,
            name: name.into(),
            status: InstanceStatus::Creating,
            configuration: InstanceConfiguration::default(),
            timestamps: InstanceTimestamps::default(),
            spot_status: None,
            spot_reclaim_time: None,
            gpu_ids: None,
            webhook_url: None,
            last_error: None,
        }
    }

    /// Build a minimal state from a provider record (startup sync path, when
    /// the provider knows an instance we have never seen).
    pub fn from_provider(instance: &InstanceData) -> Self {
        let mut state = Self::new(instance.id.clone(), instance.name.clone());
        state.novita_instance_id = Some(instance.id.clone());
        state.absorb_provider(instance);
        state
    }

    /// Fold provider-side fields into the cached state.
    pub fn absorb_provider(&mut self, instance: &InstanceData) {
        self.status = InstanceStatus::from_provider(&instance.status);
        self.spot_status = instance.spot_status.clone();
        self.spot_reclaim_time = instance.spot_reclaim_time.clone();
        self.gpu_ids = instance.gpu_ids.clone();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = InstanceStatus::Failed;
        self.timestamps.failed = Some(Utc::now());
        self.last_error = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_status_mapping() {
        assert_eq!(
            InstanceStatus::from_provider("running"),
            InstanceStatus::Running
        );
        assert_eq!(
            InstanceStatus::from_provider("exited"),
            InstanceStatus::Exited
        );
        assert_eq!(
            InstanceStatus::from_provider("pulling"),
            InstanceStatus::Starting
        );
    }

    #[test]
    fn test_state_serializes_camel_case() {
        let mut state = InstanceState::new("inst_1", "n1");
        state.novita_instance_id = Some("nov-1".to_string());
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("novitaInstanceId"));
        assert!(json.contains(r#""status":"creating""#));
    }

    #[test]
    fn test_mark_failed_sets_timestamps() {
        let mut state = InstanceState::new("inst_1", "n1");
        state.mark_failed("boom");
        assert_eq!(state.status, InstanceStatus::Failed);
        assert!(state.timestamps.failed.is_some());
        assert_eq!(state.last_error.as_deref(), Some("boom"));
    }
}
