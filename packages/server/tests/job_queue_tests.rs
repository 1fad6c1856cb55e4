//! Job queue integration tests against the in-memory KV store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use server_core::kernel::jobs::{
    HandlerRegistry, Job, JobFilter, JobHandler, JobPayload, JobPriority, JobStatus, JobType,
    NonRetryableError, QueueConfig, QueueWorker, RedisJobQueue, SweepPayload,
};
use server_core::kernel::kv_store::KvStore;
use server_core::kernel::MemoryKvStore;

fn queue_config() -> QueueConfig {
    QueueConfig {
        processing_interval: Duration::from_millis(10),
        cleanup_interval: Duration::from_secs(300),
        processing_timeout: Duration::from_millis(200),
        max_retry_delay: Duration::from_secs(300),
        max_completed_jobs: 100,
        max_failed_jobs: 100,
        default_max_attempts: 3,
    }
}

fn setup() -> (Arc<MemoryKvStore>, Arc<RedisJobQueue>) {
    let kv = Arc::new(MemoryKvStore::new());
    let queue = Arc::new(RedisJobQueue::new(kv.clone(), queue_config()));
    (kv, queue)
}

/// Handler that counts executions and optionally fails the first N.
struct CountingHandler {
    executions: AtomicU32,
    fail_first: u32,
}

impl CountingHandler {
    fn new(fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            executions: AtomicU32::new(0),
            fail_first,
        })
    }

    fn count(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn execute(&self, _job: &Job) -> Result<()> {
        let n = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_first {
            bail!("induced failure {}", n);
        }
        Ok(())
    }
}

struct NonRetryableHandler;

#[async_trait]
impl JobHandler for NonRetryableHandler {
    async fn execute(&self, _job: &Job) -> Result<()> {
        bail!(NonRetryableError("bad input".to_string()));
    }
}

fn sweep(job_type: JobType) -> JobPayload {
    match job_type {
        JobType::MigrateSpotInstances => JobPayload::MigrateSpotInstances(SweepPayload::now()),
        JobType::HandleFailedMigrations => JobPayload::HandleFailedMigrations(SweepPayload::now()),
        JobType::AutoStopCheck => JobPayload::AutoStopCheck(SweepPayload::now()),
        other => panic!("not a sweep type: {}", other),
    }
}

async fn drain_one(worker: &QueueWorker) {
    worker.tick().await.expect("tick failed");
}

#[tokio::test]
async fn test_add_then_get_round_trips() {
    let (_kv, queue) = setup();
    let id = queue
        .add(sweep(JobType::MigrateSpotInstances), JobPriority::High, None)
        .await
        .unwrap();

    let job = queue.get(&id).await.unwrap().expect("job must exist");
    assert_eq!(job.id, id);
    assert_eq!(job.job_type(), JobType::MigrateSpotInstances);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.priority, JobPriority::High);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 3);
}

#[tokio::test]
async fn test_priority_ordering_across_classes() {
    let (_kv, queue) = setup();

    // Interleave priorities; within a class, insertion order is age order.
    let low = queue
        .add(sweep(JobType::AutoStopCheck), JobPriority::Low, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let normal_1 = queue
        .add(sweep(JobType::AutoStopCheck), JobPriority::Normal, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let critical = queue
        .add(sweep(JobType::AutoStopCheck), JobPriority::Critical, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let high = queue
        .add(sweep(JobType::AutoStopCheck), JobPriority::High, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let normal_2 = queue
        .add(sweep(JobType::AutoStopCheck), JobPriority::Normal, None)
        .await
        .unwrap();

    let mut popped = Vec::new();
    while let Some(id) = queue.pop_candidate().await.unwrap() {
        assert!(queue.try_claim(&id).await.unwrap());
        popped.push(id);
    }

    assert_eq!(popped, vec![critical, high, normal_1, normal_2, low]);
}

#[tokio::test]
async fn test_claim_is_exclusive() {
    let (_kv, queue) = setup();
    let id = queue
        .add(sweep(JobType::AutoStopCheck), JobPriority::Normal, None)
        .await
        .unwrap();

    assert!(queue.try_claim(&id).await.unwrap());
    // Second claim on the same id loses the race.
    assert!(!queue.try_claim(&id).await.unwrap());
}

#[tokio::test]
async fn test_job_lives_in_exactly_one_structure() {
    let (_kv, queue) = setup();
    let id = queue
        .add(sweep(JobType::MigrateSpotInstances), JobPriority::Normal, None)
        .await
        .unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(
        (stats.pending, stats.retrying, stats.processing),
        (1, 0, 0)
    );

    assert!(queue.try_claim(&id).await.unwrap());
    let stats = queue.stats().await.unwrap();
    assert_eq!(
        (stats.pending, stats.retrying, stats.processing),
        (0, 0, 1)
    );

    let job = queue.get(&id).await.unwrap().unwrap();
    queue.complete(job).await.unwrap();
    let stats = queue.stats().await.unwrap();
    assert_eq!(
        (stats.pending, stats.retrying, stats.processing, stats.completed),
        (0, 0, 0, 1)
    );
}

#[tokio::test]
async fn test_failed_job_retries_with_backoff() {
    let (_kv, queue) = setup();
    let handler = CountingHandler::new(1);
    let mut registry = HandlerRegistry::new();
    registry.register(JobType::MigrateSpotInstances, handler.clone());
    let worker = QueueWorker::new(queue.clone(), Arc::new(registry));

    let id = queue
        .add(sweep(JobType::MigrateSpotInstances), JobPriority::Normal, None)
        .await
        .unwrap();

    // First execution fails and lands on the retry queue.
    drain_one(&worker).await;
    assert_eq!(handler.count(), 1);
    let job = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    let retry_at = job.next_retry_at.expect("retry must be scheduled");
    let delay_ms = retry_at
        .signed_duration_since(chrono::Utc::now())
        .num_milliseconds();
    // First retry uses the 100ms base delay.
    assert!(delay_ms <= 100, "delay was {}ms", delay_ms);

    // After the backoff elapses the job runs again and completes.
    tokio::time::sleep(Duration::from_millis(150)).await;
    drain_one(&worker).await;
    assert_eq!(handler.count(), 2);
    let job = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
}

#[tokio::test]
async fn test_exhausted_attempts_move_to_failed_ledger() {
    let (_kv, queue) = setup();
    let handler = CountingHandler::new(u32::MAX);
    let mut registry = HandlerRegistry::new();
    registry.register(JobType::MigrateSpotInstances, handler.clone());
    let worker = QueueWorker::new(queue.clone(), Arc::new(registry));

    let id = queue
        .add(
            sweep(JobType::MigrateSpotInstances),
            JobPriority::Normal,
            Some(2),
        )
        .await
        .unwrap();

    for _ in 0..2 {
        drain_one(&worker).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        drain_one(&worker).await; // promotes and possibly re-runs
    }

    let job = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert!(job.error.is_some());
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.processing, 0);
}

#[tokio::test]
async fn test_non_retryable_error_fails_immediately() {
    let (_kv, queue) = setup();
    let mut registry = HandlerRegistry::new();
    registry.register(JobType::MigrateSpotInstances, Arc::new(NonRetryableHandler));
    let worker = QueueWorker::new(queue.clone(), Arc::new(registry));

    let id = queue
        .add(sweep(JobType::MigrateSpotInstances), JobPriority::Normal, None)
        .await
        .unwrap();
    drain_one(&worker).await;

    let job = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.retrying, 0);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn test_ephemeral_job_leaves_no_record() {
    let (kv, queue) = setup();
    let handler = CountingHandler::new(0);
    let mut registry = HandlerRegistry::new();
    registry.register(JobType::AutoStopCheck, handler.clone());
    let worker = QueueWorker::new(queue.clone(), Arc::new(registry));

    let id = queue
        .add(sweep(JobType::AutoStopCheck), JobPriority::Normal, Some(1))
        .await
        .unwrap();
    drain_one(&worker).await;

    assert_eq!(handler.count(), 1);
    assert!(queue.get(&id).await.unwrap().is_none());
    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.completed, stats.failed), (0, 0));
    assert!(!kv.exists(&format!("jobs:data:{}", id)).await.unwrap());
}

#[tokio::test]
async fn test_ephemeral_job_failure_leaves_no_record_and_no_retry() {
    let (_kv, queue) = setup();
    let handler = CountingHandler::new(u32::MAX);
    let mut registry = HandlerRegistry::new();
    registry.register(JobType::AutoStopCheck, handler.clone());
    let worker = QueueWorker::new(queue.clone(), Arc::new(registry));

    let id = queue
        .add(sweep(JobType::AutoStopCheck), JobPriority::Normal, None)
        .await
        .unwrap();
    drain_one(&worker).await;

    assert!(queue.get(&id).await.unwrap().is_none());
    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.retrying, stats.failed), (0, 0));
}

#[tokio::test]
async fn test_stale_claim_is_recovered_to_retry() {
    let (_kv, queue) = setup();
    let id = queue
        .add(sweep(JobType::MigrateSpotInstances), JobPriority::Normal, None)
        .await
        .unwrap();

    // Simulate a worker that claimed the job and crashed.
    assert!(queue.try_claim(&id).await.unwrap());
    let mut job = queue.get(&id).await.unwrap().unwrap();
    job.attempts = 1;
    job.status = JobStatus::Processing;
    queue.persist(&job).await.unwrap();

    // The claim is fresh, so nothing is recovered yet.
    assert_eq!(queue.recover_stale_claims().await.unwrap(), 0);

    // Once the processing timeout (200ms in this config) passes, the claim
    // is recovered onto the retry queue with a backoff.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(queue.recover_stale_claims().await.unwrap(), 1);

    let job = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.next_retry_at.is_some());
    let stats = queue.stats().await.unwrap();
    assert_eq!((stats.processing, stats.retrying), (0, 1));

    // Attempts are incremented on the next pop, not during recovery.
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_stale_claim_with_exhausted_attempts_fails() {
    let (_kv, queue) = setup();
    let id = queue
        .add(
            sweep(JobType::MigrateSpotInstances),
            JobPriority::Normal,
            Some(1),
        )
        .await
        .unwrap();

    assert!(queue.try_claim(&id).await.unwrap());
    let mut job = queue.get(&id).await.unwrap().unwrap();
    job.attempts = 1;
    queue.persist(&job).await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(queue.recover_stale_claims().await.unwrap(), 1);

    let job = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("Job processing timeout"));
}

#[tokio::test]
async fn test_completed_ledger_is_trimmed() {
    let kv = Arc::new(MemoryKvStore::new());
    let mut config = queue_config();
    config.max_completed_jobs = 3;
    let queue = Arc::new(RedisJobQueue::new(kv.clone(), config));

    let handler = CountingHandler::new(0);
    let mut registry = HandlerRegistry::new();
    registry.register(JobType::MigrateSpotInstances, handler);
    let worker = QueueWorker::new(queue.clone(), Arc::new(registry));

    for _ in 0..5 {
        queue
            .add(sweep(JobType::MigrateSpotInstances), JobPriority::Normal, None)
            .await
            .unwrap();
        drain_one(&worker).await;
    }

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.completed, 3);
}

#[tokio::test]
async fn test_delayed_job_waits_for_due_time() {
    let (_kv, queue) = setup();
    let handler = CountingHandler::new(0);
    let mut registry = HandlerRegistry::new();
    registry.register(JobType::MigrateSpotInstances, handler.clone());
    let worker = QueueWorker::new(queue.clone(), Arc::new(registry));

    queue
        .add_delayed(
            sweep(JobType::MigrateSpotInstances),
            JobPriority::Normal,
            None,
            Duration::from_millis(100),
        )
        .await
        .unwrap();

    drain_one(&worker).await;
    assert_eq!(handler.count(), 0, "job must not run before its due time");

    tokio::time::sleep(Duration::from_millis(150)).await;
    drain_one(&worker).await;
    assert_eq!(handler.count(), 1);
}

#[tokio::test]
async fn test_cleanup_orphaned_data() {
    let (kv, queue) = setup();
    let id = queue
        .add(sweep(JobType::MigrateSpotInstances), JobPriority::Normal, None)
        .await
        .unwrap();

    // Referenced data survives.
    assert_eq!(queue.cleanup_orphaned_data().await.unwrap(), 0);

    // Drop the queue reference; the record is now orphaned.
    kv.zrem("jobs:queue", &id).await.unwrap();
    assert_eq!(queue.cleanup_orphaned_data().await.unwrap(), 1);
    assert!(queue.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_list_filters_by_status_and_type() {
    let (_kv, queue) = setup();
    queue
        .add(sweep(JobType::MigrateSpotInstances), JobPriority::Normal, None)
        .await
        .unwrap();
    queue
        .add(sweep(JobType::HandleFailedMigrations), JobPriority::Normal, None)
        .await
        .unwrap();

    let migrations = queue
        .list(JobFilter {
            status: Some(JobStatus::Pending),
            job_type: Some(JobType::MigrateSpotInstances),
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(migrations.len(), 1);

    let all = queue.list(JobFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_legacy_double_encoded_job_record_is_readable() {
    let (kv, queue) = setup();
    let id = queue
        .add(sweep(JobType::MigrateSpotInstances), JobPriority::Normal, None)
        .await
        .unwrap();
    let job = queue.get(&id).await.unwrap().unwrap();

    // Rewrite the record the way a legacy writer did: the document inside
    // a JSON string.
    let double = serde_json::to_vec(&serde_json::to_string(&job).unwrap()).unwrap();
    let data_key = format!("jobs:data:{}", id);
    kv.hset(&data_key, "data", double).await.unwrap();

    // Reads fall back to the string interpretation.
    let back = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(back.id, id);
    assert_eq!(back.job_type(), JobType::MigrateSpotInstances);

    // The next update rewrites the canonical form.
    queue.persist(&back).await.unwrap();
    let raw = kv.hget(&data_key, "data").await.unwrap().unwrap();
    let document: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert!(document.is_object());
}
