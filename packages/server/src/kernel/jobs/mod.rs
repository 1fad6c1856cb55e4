//! Job infrastructure for background command execution.
//!
//! This module provides the kernel-level job machinery:
//! - [`Job`] - job model with the tagged payload sum and workflow-step trail
//! - [`RedisJobQueue`] - durable priority queue with retry, claim, and ledgers
//! - [`HandlerRegistry`] - job-type to handler mapping
//! - [`QueueWorker`] - long-running service that claims and dispatches jobs
//!
//! Domain-specific handlers live in their respective domains; this module
//! only provides the infrastructure.

mod job;
mod queue;
mod registry;
mod worker;

pub use job::{
    queue_score, retry_backoff, CreateInstancePayload, Job, JobPayload, JobPriority, JobStatus,
    JobType, MonitorInstancePayload, NonRetryableError, SendWebhookPayload, SweepPayload,
    WorkflowStep, MAX_TIME_MS,
};
pub use queue::{
    data_key, JobFilter, ProcessingEntry, QueueConfig, QueueStats, RedisJobQueue, COMPLETED_KEY,
    FAILED_KEY, PROCESSING_KEY, QUEUE_KEY, RETRY_KEY,
};
pub use registry::{HandlerRegistry, JobHandler};
pub use worker::QueueWorker;
