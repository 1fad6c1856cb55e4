//! Queue worker service.
//!
//! One processing tick per `processing_interval`:
//!
//! ```text
//! QueueWorker tick
//!     ├─► promote retry-ready jobs back to the pending queue
//!     ├─► pop highest-priority id (ZREVRANGE 0 0)
//!     ├─► claim it (HSETNX jobs:processing + ZREM jobs:queue)
//!     │       └─► lost race? retry the pop
//!     ├─► dispatch to the registered handler
//!     └─► complete / fail (retry backoff, ledgers, ephemeral drop)
//! ```
//!
//! Multiple workers may run against the same Redis; the HSETNX claim
//! guarantees at most one processor per job. A separate cleanup tick recovers
//! stale claims left by crashed workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobStatus};
use super::queue::RedisJobQueue;
use super::registry::HandlerRegistry;
use crate::kernel::service_host::Service;

/// Bound on pop retries within one tick after lost claim races.
const MAX_POP_ATTEMPTS: usize = 10;

pub struct QueueWorker {
    queue: Arc<RedisJobQueue>,
    registry: Arc<HandlerRegistry>,
    drain_timeout: Duration,
}

impl QueueWorker {
    pub fn new(queue: Arc<RedisJobQueue>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            queue,
            registry,
            drain_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// One processing tick: promote retries, then claim and run one job.
    pub async fn tick(&self) -> Result<()> {
        self.queue.promote_due_retries().await?;

        for _ in 0..MAX_POP_ATTEMPTS {
            let Some(job_id) = self.queue.pop_candidate().await? else {
                return Ok(());
            };

            let Some(job) = self.queue.get(&job_id).await? else {
                self.queue.discard_stale_reference(&job_id).await?;
                continue;
            };

            // Not due yet (re-enqueued retry that slipped in): push it back.
            if let Some(retry_at) = job.next_retry_at {
                if retry_at > Utc::now() {
                    self.queue.defer_until_retry(&job).await?;
                    continue;
                }
            }

            if !self.queue.try_claim(&job_id).await? {
                // Another worker won this id; take the next candidate.
                debug!(job_id = %job_id, "lost claim race, retrying pop");
                continue;
            }

            self.process(job).await;
            return Ok(());
        }
        Ok(())
    }

    async fn process(&self, mut job: Job) {
        job.attempts += 1;
        job.status = JobStatus::Processing;
        job.processed_at = Some(Utc::now());
        if let Err(e) = self.queue.persist(&job).await {
            error!(job_id = %job.id, error = %e, "failed to persist claimed job");
        }

        let job_type = job.job_type();
        let Some(handler) = self.registry.get(job_type) else {
            let message = format!("no handler registered for job type: {}", job_type);
            error!(job_id = %job.id, job_type = %job_type, "{}", message);
            if let Err(e) = self.queue.fail(job, &message).await {
                error!(error = %e, "failed to record handler-missing failure");
            }
            return;
        };

        debug!(job_id = %job.id, job_type = %job_type, attempt = job.attempts, "executing job");
        match handler.execute(&job).await {
            Ok(()) => {
                debug!(job_id = %job.id, job_type = %job_type, "job succeeded");
                if let Err(e) = self.queue.complete(job).await {
                    error!(error = %e, "failed to mark job as completed");
                }
            }
            Err(e) => {
                warn!(job_id = %job.id, job_type = %job_type, error = %e, "job failed");
                let non_retryable = e
                    .chain()
                    .any(|cause| cause.downcast_ref::<super::job::NonRetryableError>().is_some());
                if non_retryable {
                    // Exhaust the attempt budget so the failure is terminal.
                    job.attempts = job.max_attempts;
                }
                if let Err(persist_err) = self.queue.fail(job, &e.to_string()).await {
                    error!(error = %persist_err, "failed to record job failure");
                }
            }
        }
    }

    /// Wait for in-flight jobs to drain after the loops have stopped.
    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        loop {
            match self.queue.processing_count().await {
                Ok(0) => return,
                Ok(count) if tokio::time::Instant::now() >= deadline => {
                    warn!(remaining = count, "shutdown drain timed out with jobs still processing");
                    return;
                }
                Ok(count) => {
                    debug!(remaining = count, "waiting for processing jobs to drain");
                }
                Err(e) => {
                    warn!(error = %e, "could not check processing set during drain");
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[async_trait]
impl Service for QueueWorker {
    fn name(&self) -> &'static str {
        "queue-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let config = self.queue.config().clone();
        let mut processing = tokio::time::interval(config.processing_interval);
        let mut cleanup = tokio::time::interval(config.cleanup_interval);
        cleanup.tick().await; // skip the immediate cleanup tick

        info!(worker_id = %self.queue.worker_id(), "queue worker starting");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = processing.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "processing tick failed");
                    }
                }
                _ = cleanup.tick() => {
                    match self.queue.recover_stale_claims().await {
                        Ok(recovered) if recovered > 0 => {
                            info!(recovered, "recovered stale claims");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "stale-claim recovery failed"),
                    }
                }
            }
        }

        self.drain().await;
        info!(worker_id = %self.queue.worker_id(), "queue worker stopped");
        Ok(())
    }
}
