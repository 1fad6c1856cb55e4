//! Job model for background command execution.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{ids, WebhookPayload};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    CreateInstance,
    MonitorInstance,
    SendWebhook,
    MigrateSpotInstances,
    HandleFailedMigrations,
    AutoStopCheck,
}

impl JobType {
    /// Ephemeral jobs leave no history: the persisted record is deleted on
    /// terminal state, with no retries and no ledger entry. Periodic check
    /// jobs are ephemeral because retaining them only bloats storage.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, JobType::AutoStopCheck)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::CreateInstance => "CreateInstance",
            JobType::MonitorInstance => "MonitorInstance",
            JobType::SendWebhook => "SendWebhook",
            JobType::MigrateSpotInstances => "MigrateSpotInstances",
            JobType::HandleFailedMigrations => "HandleFailedMigrations",
            JobType::AutoStopCheck => "AutoStopCheck",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl JobPriority {
    /// Numeric class used in the queue score (higher sorts first).
    pub fn as_level(&self) -> u8 {
        match self {
            JobPriority::Low => 0,
            JobPriority::Normal => 1,
            JobPriority::High => 2,
            JobPriority::Critical => 3,
        }
    }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstancePayload {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    pub name: String,
    #[serde(rename = "productName")]
    pub product_name: String,
    #[serde(rename = "templateId")]
    pub template_id: String,
    #[serde(rename = "gpuNum")]
    pub gpu_num: i64,
    #[serde(rename = "rootfsSize")]
    pub rootfs_size: i64,
    pub region: String,
    #[serde(rename = "webhookUrl", skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorInstancePayload {
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    #[serde(rename = "novitaInstanceId")]
    pub novita_instance_id: String,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    /// Total budget for the startup watch, in milliseconds.
    #[serde(rename = "maxWaitTimeMs")]
    pub max_wait_time_ms: u64,
    #[serde(rename = "webhookUrl", skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendWebhookPayload {
    pub url: String,
    pub payload: WebhookPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepPayload {
    #[serde(rename = "scheduledAt")]
    pub scheduled_at: DateTime<Utc>,
}

impl SweepPayload {
    pub fn now() -> Self {
        Self {
            scheduled_at: Utc::now(),
        }
    }
}

/// Tagged sum over job payloads. The tag doubles as the job type; dispatch is
/// a straight map lookup, never a runtime type probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobPayload {
    CreateInstance(CreateInstancePayload),
    MonitorInstance(MonitorInstancePayload),
    SendWebhook(SendWebhookPayload),
    MigrateSpotInstances(SweepPayload),
    HandleFailedMigrations(SweepPayload),
    AutoStopCheck(SweepPayload),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::CreateInstance(_) => JobType::CreateInstance,
            JobPayload::MonitorInstance(_) => JobType::MonitorInstance,
            JobPayload::SendWebhook(_) => JobType::SendWebhook,
            JobPayload::MigrateSpotInstances(_) => JobType::MigrateSpotInstances,
            JobPayload::HandleFailedMigrations(_) => JobType::HandleFailedMigrations,
            JobPayload::AutoStopCheck(_) => JobType::AutoStopCheck,
        }
    }
}

/// Marker error for failures that must not be retried (validation, auth).
/// The worker fails the job immediately when this appears in an error chain,
/// regardless of remaining attempts.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct NonRetryableError(pub String);

// ============================================================================
// Workflow step trail
// ============================================================================

/// One entry in a job's per-attempt trail, retained with the job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub at: DateTime<Utc>,
    pub step: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl WorkflowStep {
    pub fn ok(step: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            step: step.into(),
            ok: true,
            detail: None,
        }
    }

    pub fn failed(step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            step: step.into(),
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub attempts: u32,
    #[serde(rename = "maxAttempts")]
    pub max_attempts: u32,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "processedAt", skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(rename = "nextRetryAt", skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

impl Job {
    pub fn new(payload: JobPayload, priority: JobPriority, max_attempts: u32) -> Self {
        Self {
            id: ids::job_id(),
            payload,
            status: JobStatus::Pending,
            priority,
            attempts: 0,
            max_attempts,
            created_at: Utc::now(),
            processed_at: None,
            completed_at: None,
            next_retry_at: None,
            error: None,
            steps: Vec::new(),
        }
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.job_type().is_ephemeral()
    }

    pub fn record_step(&mut self, step: WorkflowStep) {
        self.steps.push(step);
    }
}

// ============================================================================
// Queue scoring and retry backoff
// ============================================================================

/// Epoch-millisecond horizon used to invert creation time in the queue score.
/// Comfortably beyond any realistic timestamp (~year 2286).
pub const MAX_TIME_MS: i64 = 10_000_000_000_000;

const PRIORITY_BAND: f64 = 1e13;

/// Score for the pending queue ZSET.
///
/// `priority * 1e13 + (MAX_TIME - created_at)`: the age term is strictly below
/// one priority band, so priority dominates and older jobs score higher within
/// a class. Popping `ZREVRANGE 0 0` therefore yields strict priority order
/// with FIFO inside each class. Equal-millisecond ties fall back to ZSET
/// member order; ids embed the timestamp, so that order is stable.
pub fn queue_score(priority: JobPriority, created_at: DateTime<Utc>) -> f64 {
    let age_component = (MAX_TIME_MS - created_at.timestamp_millis()) as f64;
    priority.as_level() as f64 * PRIORITY_BAND + age_component
}

const RETRY_BASE_DELAY_MS: u64 = 100;

/// Exponential retry backoff: `min(100ms * 2^(attempts-1), max_delay)`.
pub fn retry_backoff(attempts: u32, max_delay: Duration) -> Duration {
    let attempts = attempts.max(1);
    let exp = (attempts - 1).min(31);
    let delay_ms = RETRY_BASE_DELAY_MS.saturating_mul(1u64 << exp);
    Duration::from_millis(delay_ms).min(max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn payload() -> JobPayload {
        JobPayload::AutoStopCheck(SweepPayload::now())
    }

    #[test]
    fn test_priority_dominates_age() {
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();

        // A brand-new Critical job outranks a decade-old Low job.
        assert!(queue_score(JobPriority::Critical, new) > queue_score(JobPriority::Low, old));
        // Within a class, older scores higher.
        assert!(queue_score(JobPriority::Normal, old) > queue_score(JobPriority::Normal, new));
    }

    #[test]
    fn test_backoff_sequence() {
        let max = Duration::from_secs(300);
        assert_eq!(retry_backoff(1, max), Duration::from_millis(100));
        assert_eq!(retry_backoff(2, max), Duration::from_millis(200));
        assert_eq!(retry_backoff(3, max), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_saturates_at_max() {
        let max = Duration::from_millis(250);
        assert_eq!(retry_backoff(3, max), max);
        // Large attempt counts must not overflow the shift.
        assert_eq!(retry_backoff(64, max), max);
    }

    #[test]
    fn test_payload_round_trips_with_type_tag() {
        let job = Job::new(payload(), JobPriority::High, 3);
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains(r#""type":"AutoStopCheck""#));

        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_type(), JobType::AutoStopCheck);
        assert_eq!(back.priority, JobPriority::High);
    }

    #[test]
    fn test_ephemeral_classification() {
        assert!(JobType::AutoStopCheck.is_ephemeral());
        assert!(!JobType::CreateInstance.is_ephemeral());
        assert!(!JobType::MigrateSpotInstances.is_ephemeral());
    }
}
