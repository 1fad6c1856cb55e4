//! Redis-backed durable job queue.
//!
//! Storage model (all keys behind the process prefix):
//! - `jobs:queue` - pending ids, ZSET scored by priority band + inverted age
//! - `jobs:retry` - ids awaiting retry, ZSET scored by `next_retry_at` millis
//! - `jobs:processing` - hash `id -> {startedAt, workerId}` (the claim)
//! - `jobs:completed` / `jobs:failed` - capped terminal ledgers, ZSET scored
//!   by completion time
//! - `jobs:data:<id>` - hash with a single `data` field holding the Job
//!
//! Invariant: a job id lives in exactly one of queue/retry/processing/ledger
//! at any instant, and its data record exists iff it is referenced from one
//! of them (ephemeral jobs are deleted at terminal state instead).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::job::{
    queue_score, retry_backoff, Job, JobPayload, JobPriority, JobStatus, JobType, WorkflowStep,
};
use crate::kernel::codec;
use crate::kernel::kv_store::KvStore;

pub const QUEUE_KEY: &str = "jobs:queue";
pub const RETRY_KEY: &str = "jobs:retry";
pub const PROCESSING_KEY: &str = "jobs:processing";
pub const COMPLETED_KEY: &str = "jobs:completed";
pub const FAILED_KEY: &str = "jobs:failed";

const DATA_FIELD: &str = "data";
const SCAN_BATCH: usize = 100;

pub fn data_key(job_id: &str) -> String {
    format!("jobs:data:{}", job_id)
}

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Cadence of the processing tick (one claim per tick).
    pub processing_interval: Duration,
    /// Cadence of the stale-claim recovery pass.
    pub cleanup_interval: Duration,
    /// Age at which a processing claim is considered abandoned.
    pub processing_timeout: Duration,
    /// Ceiling for exponential retry backoff.
    pub max_retry_delay: Duration,
    pub max_completed_jobs: usize,
    pub max_failed_jobs: usize,
    pub default_max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            processing_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(300),
            processing_timeout: Duration::from_secs(600),
            max_retry_delay: Duration::from_secs(300),
            max_completed_jobs: 100,
            max_failed_jobs: 100,
            default_max_attempts: 3,
        }
    }
}

/// An entry in the processing hash: who claimed the job and when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingEntry {
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "workerId", skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

/// Filter for [`RedisJobQueue::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub limit: Option<usize>,
}

/// Counts across all queue structures.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub retrying: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Durable priority queue over the KV store.
pub struct RedisJobQueue {
    kv: Arc<dyn KvStore>,
    config: QueueConfig,
    worker_id: String,
}

impl RedisJobQueue {
    pub fn new(kv: Arc<dyn KvStore>, config: QueueConfig) -> Self {
        Self {
            kv,
            config,
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    // =========================================================================
    // Producer API
    // =========================================================================

    /// Enqueue a job. Returns the new job id.
    pub async fn add(
        &self,
        payload: JobPayload,
        priority: JobPriority,
        max_attempts: Option<u32>,
    ) -> Result<String> {
        let job = Job::new(
            payload,
            priority,
            max_attempts.unwrap_or(self.config.default_max_attempts),
        );
        let id = job.id.clone();

        self.persist(&job).await?;
        self.kv
            .zadd(QUEUE_KEY, queue_score(job.priority, job.created_at), &id)
            .await?;

        debug!(job_id = %id, job_type = %job.job_type(), priority = ?priority, "job enqueued");
        Ok(id)
    }

    /// Enqueue a job that becomes due after `delay`. The job is parked on the
    /// retry queue, so it survives restarts; the worker promotes it once due.
    pub async fn add_delayed(
        &self,
        payload: JobPayload,
        priority: JobPriority,
        max_attempts: Option<u32>,
        delay: Duration,
    ) -> Result<String> {
        let mut job = Job::new(
            payload,
            priority,
            max_attempts.unwrap_or(self.config.default_max_attempts),
        );
        let due_at = Utc::now() + chrono::Duration::from_std(delay)?;
        job.next_retry_at = Some(due_at);
        let id = job.id.clone();

        self.persist(&job).await?;
        self.kv
            .zadd(RETRY_KEY, due_at.timestamp_millis() as f64, &id)
            .await?;

        debug!(job_id = %id, job_type = %job.job_type(), delay_ms = delay.as_millis() as u64,
            "delayed job enqueued");
        Ok(id)
    }

    /// Load a job by id.
    ///
    /// Reads tolerate legacy encodings (double-encoded documents); every
    /// mutation goes through [`persist`](Self::persist), so a tolerated
    /// record regains the canonical form on its next update.
    pub async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let Some(bytes) = self.kv.hget(&data_key(job_id), DATA_FIELD).await? else {
            return Ok(None);
        };
        let job = codec::decode_tolerant(&bytes)
            .with_context(|| format!("job record {} is corrupt", job_id))?;
        Ok(Some(job))
    }

    /// Enumerate jobs via SCAN over the data namespace.
    ///
    /// This walks every job record and is O(N); it exists for scheduler
    /// deduplication and admin views, not for hot paths.
    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut jobs = Vec::new();
        let mut cursor = 0u64;

        loop {
            let (next, keys) = self.kv.scan(cursor, "jobs:data:*", SCAN_BATCH).await?;
            for key in keys {
                if !key.starts_with("jobs:data:") {
                    continue;
                }
                let Some(bytes) = self.kv.hget(&key, DATA_FIELD).await? else {
                    continue;
                };
                let Ok(job) = codec::decode_tolerant::<Job>(&bytes) else {
                    warn!(key = %key, "skipping corrupt job record");
                    continue;
                };
                if let Some(status) = filter.status {
                    if job.status != status {
                        continue;
                    }
                }
                if let Some(job_type) = filter.job_type {
                    if job.job_type() != job_type {
                        continue;
                    }
                }
                jobs.push(job);
                if jobs.len() >= limit {
                    return Ok(jobs);
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(jobs)
    }

    /// Find a non-terminal (Pending or Processing) job of the given type.
    /// Used by schedulers to dedupe before enqueueing.
    pub async fn find_active(&self, job_type: JobType) -> Result<Option<Job>> {
        let jobs = self
            .list(JobFilter {
                status: None,
                job_type: Some(job_type),
                limit: None,
            })
            .await?;
        Ok(jobs
            .into_iter()
            .find(|job| matches!(job.status, JobStatus::Pending | JobStatus::Processing)))
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.kv.zcard(QUEUE_KEY).await?,
            retrying: self.kv.zcard(RETRY_KEY).await?,
            processing: self.kv.hlen(PROCESSING_KEY).await?,
            completed: self.kv.zcard(COMPLETED_KEY).await?,
            failed: self.kv.zcard(FAILED_KEY).await?,
        })
    }

    /// Append a workflow step to a job's trail and persist it.
    pub async fn append_step(&self, job_id: &str, step: WorkflowStep) -> Result<()> {
        if let Some(mut job) = self.get(job_id).await? {
            job.record_step(step);
            self.persist(&job).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Consumer API (driven by the queue worker)
    // =========================================================================

    /// Move retry-ready jobs back into the pending queue.
    pub async fn promote_due_retries(&self) -> Result<usize> {
        let now = Utc::now().timestamp_millis() as f64;
        let due = self.kv.zrange_by_score(RETRY_KEY, 0.0, now).await?;
        let mut promoted = 0;

        for job_id in due {
            let Some(mut job) = self.get(&job_id).await? else {
                // Dangling retry reference; drop it.
                self.kv.zrem(RETRY_KEY, &job_id).await?;
                continue;
            };
            job.status = JobStatus::Pending;
            job.next_retry_at = None;
            self.persist(&job).await?;
            self.kv
                .zadd(QUEUE_KEY, queue_score(job.priority, job.created_at), &job_id)
                .await?;
            self.kv.zrem(RETRY_KEY, &job_id).await?;
            promoted += 1;
        }

        if promoted > 0 {
            debug!(promoted, "promoted retry-ready jobs");
        }
        Ok(promoted)
    }

    /// Peek the highest-priority pending job id.
    pub async fn pop_candidate(&self) -> Result<Option<String>> {
        let ids = self.kv.zrevrange(QUEUE_KEY, 0, 0).await?;
        Ok(ids.into_iter().next())
    }

    /// Claim a job: write the processing entry (only if absent) and remove the
    /// id from the pending queue. Across concurrent consumers exactly one
    /// claim wins; the loser sees `false` and must retry its pop.
    pub async fn try_claim(&self, job_id: &str) -> Result<bool> {
        let entry = ProcessingEntry {
            started_at: Utc::now(),
            worker_id: Some(self.worker_id.clone()),
        };
        let won = self
            .kv
            .hset_nx(PROCESSING_KEY, job_id, codec::encode(&entry)?)
            .await?;
        if won {
            self.kv.zrem(QUEUE_KEY, job_id).await?;
        }
        Ok(won)
    }

    /// Drop a stale reference from the pending queue.
    pub async fn discard_stale_reference(&self, job_id: &str) -> Result<()> {
        self.kv.zrem(QUEUE_KEY, job_id).await?;
        warn!(job_id = %job_id, "dropped queue reference to missing job record");
        Ok(())
    }

    /// Push a not-yet-due job back onto the retry queue.
    pub async fn defer_until_retry(&self, job: &Job) -> Result<()> {
        let retry_at = job
            .next_retry_at
            .map(|at| at.timestamp_millis())
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        self.kv.zrem(QUEUE_KEY, &job.id).await?;
        self.kv.zadd(RETRY_KEY, retry_at as f64, &job.id).await?;
        Ok(())
    }

    pub async fn persist(&self, job: &Job) -> Result<()> {
        self.kv
            .hset(&data_key(&job.id), DATA_FIELD, codec::encode(job)?)
            .await
    }

    pub async fn delete_data(&self, job_id: &str) -> Result<()> {
        self.kv.del(&data_key(job_id)).await?;
        Ok(())
    }

    /// Success path: release the claim, then either drop the record
    /// (ephemeral) or move it to the completed ledger.
    pub async fn complete(&self, mut job: Job) -> Result<()> {
        self.kv.hdel(PROCESSING_KEY, &job.id).await?;

        if job.is_ephemeral() {
            self.delete_data(&job.id).await?;
            debug!(job_id = %job.id, job_type = %job.job_type(), "ephemeral job completed, record dropped");
            return Ok(());
        }

        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.record_step(WorkflowStep::ok("completed"));
        self.persist(&job).await?;
        self.kv
            .zadd(COMPLETED_KEY, now.timestamp_millis() as f64, &job.id)
            .await?;
        self.trim_ledger(COMPLETED_KEY, self.config.max_completed_jobs)
            .await?;
        Ok(())
    }

    /// Failure path: retry with backoff while attempts remain, otherwise move
    /// to the failed ledger. Ephemeral jobs never retry and leave no record.
    pub async fn fail(&self, mut job: Job, error: &str) -> Result<()> {
        self.kv.hdel(PROCESSING_KEY, &job.id).await?;
        job.error = Some(error.to_string());
        job.record_step(WorkflowStep::failed(
            format!("attempt {}", job.attempts),
            error,
        ));

        if job.is_ephemeral() {
            self.delete_data(&job.id).await?;
            debug!(job_id = %job.id, job_type = %job.job_type(), error = %error,
                "ephemeral job failed, record dropped");
            return Ok(());
        }

        if job.attempts < job.max_attempts {
            let delay = retry_backoff(job.attempts, self.config.max_retry_delay);
            let retry_at = Utc::now() + chrono::Duration::from_std(delay)?;
            job.status = JobStatus::Pending;
            job.next_retry_at = Some(retry_at);
            self.persist(&job).await?;
            self.kv
                .zadd(RETRY_KEY, retry_at.timestamp_millis() as f64, &job.id)
                .await?;
            info!(job_id = %job.id, job_type = %job.job_type(), attempts = job.attempts,
                delay_ms = delay.as_millis() as u64, error = %error, "job scheduled for retry");
        } else {
            let now = Utc::now();
            job.status = JobStatus::Failed;
            job.completed_at = Some(now);
            self.persist(&job).await?;
            self.kv
                .zadd(FAILED_KEY, now.timestamp_millis() as f64, &job.id)
                .await?;
            self.trim_ledger(FAILED_KEY, self.config.max_failed_jobs)
                .await?;
            warn!(job_id = %job.id, job_type = %job.job_type(), attempts = job.attempts,
                error = %error, "job failed permanently");
        }
        Ok(())
    }

    /// Evict the oldest entries beyond the ledger cap.
    async fn trim_ledger(&self, key: &str, max: usize) -> Result<()> {
        if self.kv.zcard(key).await? as usize <= max {
            return Ok(());
        }
        // ZREVRANGE is newest-first; indexes beyond the cap are the oldest.
        let evicted = self.kv.zrevrange(key, max as isize, -1).await?;
        for job_id in evicted {
            self.kv.zrem(key, &job_id).await?;
            self.delete_data(&job_id).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Recovery and garbage collection
    // =========================================================================

    /// Recover claims older than the processing timeout: retry if attempts
    /// remain, otherwise fail with a timeout error.
    pub async fn recover_stale_claims(&self) -> Result<usize> {
        let now = Utc::now();
        let entries = self.kv.hgetall(PROCESSING_KEY).await?;
        let mut recovered = 0;

        for (job_id, bytes) in entries {
            let Ok(entry) = codec::decode::<ProcessingEntry>(&bytes) else {
                warn!(job_id = %job_id, "dropping corrupt processing entry");
                self.kv.hdel(PROCESSING_KEY, &job_id).await?;
                continue;
            };
            let age = now.signed_duration_since(entry.started_at);
            if age.num_milliseconds() <= self.config.processing_timeout.as_millis() as i64 {
                continue;
            }

            let Some(mut job) = self.get(&job_id).await? else {
                self.kv.hdel(PROCESSING_KEY, &job_id).await?;
                continue;
            };

            if job.attempts < job.max_attempts {
                let delay = retry_backoff(job.attempts, self.config.max_retry_delay);
                let retry_at = now + chrono::Duration::from_std(delay)?;
                job.status = JobStatus::Pending;
                job.next_retry_at = Some(retry_at);
                job.record_step(WorkflowStep::failed(
                    format!("attempt {}", job.attempts),
                    "stale claim recovered",
                ));
                self.persist(&job).await?;
                self.kv
                    .zadd(RETRY_KEY, retry_at.timestamp_millis() as f64, &job_id)
                    .await?;
                info!(job_id = %job_id, worker_id = ?entry.worker_id, "stale claim moved to retry");
            } else {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                job.error = Some("Job processing timeout".to_string());
                self.persist(&job).await?;
                self.kv
                    .zadd(FAILED_KEY, now.timestamp_millis() as f64, &job_id)
                    .await?;
                self.trim_ledger(FAILED_KEY, self.config.max_failed_jobs)
                    .await?;
                warn!(job_id = %job_id, worker_id = ?entry.worker_id, "stale claim failed out");
            }

            self.kv.hdel(PROCESSING_KEY, &job_id).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Delete job data records no longer referenced from any queue structure.
    /// Driven by the data-cleanup scheduler.
    pub async fn cleanup_orphaned_data(&self) -> Result<usize> {
        let mut removed = 0;
        let mut cursor = 0u64;
        loop {
            let (next, keys) = self.kv.scan(cursor, "jobs:data:job_*", SCAN_BATCH).await?;
            for key in keys {
                let Some(job_id) = key.strip_prefix("jobs:data:") else {
                    continue;
                };
                if self.is_referenced(job_id).await? {
                    continue;
                }
                if self.kv.del(&key).await? {
                    removed += 1;
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        if removed > 0 {
            info!(removed, "garbage-collected orphaned job data");
        }
        Ok(removed)
    }

    async fn is_referenced(&self, job_id: &str) -> Result<bool> {
        if self.kv.zscore(QUEUE_KEY, job_id).await?.is_some()
            || self.kv.zscore(RETRY_KEY, job_id).await?.is_some()
            || self.kv.zscore(COMPLETED_KEY, job_id).await?.is_some()
            || self.kv.zscore(FAILED_KEY, job_id).await?.is_some()
        {
            return Ok(true);
        }
        Ok(self.kv.hget(PROCESSING_KEY, job_id).await?.is_some())
    }

    pub async fn processing_count(&self) -> Result<u64> {
        self.kv.hlen(PROCESSING_KEY).await
    }
}
