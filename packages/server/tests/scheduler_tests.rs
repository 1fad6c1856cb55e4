//! Scheduler behavior: dedup, health rules, lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use server_core::config::MigrationConfig;
use server_core::kernel::jobs::{
    JobFilter, JobStatus, JobType, QueueConfig, RedisJobQueue,
};
use server_core::kernel::schedulers::{
    AutoStopSweepTask, FailedMigrationSweepTask, MigrationSweepTask, PeriodicScheduler,
    SchedulerHealth, SchedulerTask,
};
use server_core::kernel::MemoryKvStore;

fn migration_config() -> MigrationConfig {
    MigrationConfig {
        enabled: true,
        schedule_interval_ms: 60_000,
        job_timeout_ms: 600_000,
        max_concurrent_migrations: 5,
        dry_run_mode: false,
        retry_failed_migrations: true,
    }
}

fn queue() -> Arc<RedisJobQueue> {
    Arc::new(RedisJobQueue::new(
        Arc::new(MemoryKvStore::new()),
        QueueConfig::default(),
    ))
}

struct FailingTask;

#[async_trait]
impl SchedulerTask for FailingTask {
    fn name(&self) -> &'static str {
        "failing-task"
    }

    fn next_delay(&self) -> Duration {
        Duration::from_secs(3600)
    }

    async fn execute(&self) -> Result<Option<String>> {
        bail!("induced tick failure");
    }
}

struct IdleTask;

#[async_trait]
impl SchedulerTask for IdleTask {
    fn name(&self) -> &'static str {
        "idle-task"
    }

    fn next_delay(&self) -> Duration {
        Duration::from_secs(3600)
    }

    async fn execute(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

struct DisabledTask;

#[async_trait]
impl SchedulerTask for DisabledTask {
    fn name(&self) -> &'static str {
        "disabled-task"
    }

    fn next_delay(&self) -> Duration {
        Duration::from_secs(3600)
    }

    fn enabled(&self) -> bool {
        false
    }

    async fn execute(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_migration_sweep_enqueues_job() {
    let queue = queue();
    let task = MigrationSweepTask::new(queue.clone(), migration_config());

    let job_id = task.execute().await.unwrap().expect("job id expected");
    let job = queue.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.job_type(), JobType::MigrateSpotInstances);
    assert_eq!(job.max_attempts, 3);
}

#[tokio::test]
async fn test_migration_sweep_dedupes_against_pending_job() {
    let queue = queue();
    let task = MigrationSweepTask::new(queue.clone(), migration_config());

    let first = task.execute().await.unwrap().unwrap();
    // A second tick while the job is still pending returns the same id.
    let second = task.execute().await.unwrap().unwrap();
    assert_eq!(first, second);

    let pending = queue
        .list(JobFilter {
            status: Some(JobStatus::Pending),
            job_type: Some(JobType::MigrateSpotInstances),
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(pending.len(), 1, "dedup must not enqueue a second sweep");
}

#[tokio::test]
async fn test_dedup_also_covers_processing_jobs() {
    let queue = queue();
    let task = MigrationSweepTask::new(queue.clone(), migration_config());

    let first = task.execute().await.unwrap().unwrap();
    // Claim the job so it is Processing, then persist that status.
    assert!(queue.try_claim(&first).await.unwrap());
    let mut job = queue.get(&first).await.unwrap().unwrap();
    job.status = JobStatus::Processing;
    queue.persist(&job).await.unwrap();

    let second = task.execute().await.unwrap().unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_failed_migration_sweep_respects_retry_flag() {
    let queue = queue();
    let mut config = migration_config();
    config.retry_failed_migrations = false;

    let task = FailedMigrationSweepTask::new(queue.clone(), config);
    assert!(!task.enabled());

    let task = FailedMigrationSweepTask::new(queue, migration_config());
    assert!(task.enabled());
    let job_id = task.execute().await.unwrap().unwrap();
    assert!(job_id.starts_with("job_"));
}

#[tokio::test]
async fn test_auto_stop_sweep_produces_ephemeral_single_attempt_job() {
    let queue = queue();
    let task = AutoStopSweepTask::new(queue.clone());

    let job_id = task.execute().await.unwrap().unwrap();
    let job = queue.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.job_type(), JobType::AutoStopCheck);
    assert!(job.is_ephemeral());
    assert_eq!(job.max_attempts, 1);

    // No dedup: a second tick produces a distinct job.
    let second = task.execute().await.unwrap().unwrap();
    assert_ne!(job_id, second);
}

#[tokio::test]
async fn test_health_enabled_but_not_running_is_unhealthy() {
    let scheduler = PeriodicScheduler::new(Arc::new(IdleTask));
    assert_eq!(scheduler.health(), SchedulerHealth::Unhealthy);

    scheduler.start();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(scheduler.health(), SchedulerHealth::Healthy);
    assert!(scheduler.status().running);
}

#[tokio::test]
async fn test_health_disabled_is_healthy() {
    let scheduler = PeriodicScheduler::new(Arc::new(DisabledTask));
    // Disabled means intentionally idle, even when not running.
    assert_eq!(scheduler.health(), SchedulerHealth::Healthy);
    assert!(!scheduler.status().enabled);
}

#[tokio::test]
async fn test_health_degrades_on_failure_ratio() {
    let scheduler = PeriodicScheduler::new(Arc::new(FailingTask));
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(20)).await;

    for _ in 0..10 {
        let _ = scheduler.execute_now().await;
    }

    let status = scheduler.status();
    assert_eq!(status.total_executions, 10);
    assert_eq!(status.failed_executions, 10);
    assert_eq!(scheduler.health(), SchedulerHealth::Unhealthy);
}

#[tokio::test]
async fn test_shutdown_marks_unhealthy() {
    let scheduler = PeriodicScheduler::new(Arc::new(IdleTask));
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(20)).await;

    scheduler.shutdown(Duration::from_millis(100)).await;
    assert_eq!(scheduler.health(), SchedulerHealth::Unhealthy);
    assert!(!scheduler.status().running);
}

#[tokio::test]
async fn test_stop_then_start_resumes() {
    let scheduler = PeriodicScheduler::new(Arc::new(IdleTask));
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(scheduler.status().running);

    scheduler.stop();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!scheduler.status().running);

    scheduler.start();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(scheduler.status().running);
    assert_eq!(scheduler.health(), SchedulerHealth::Healthy);
}

#[tokio::test]
async fn test_execute_now_counts_executions() {
    let queue = queue();
    let scheduler = PeriodicScheduler::new(Arc::new(AutoStopSweepTask::new(queue)));

    let first = scheduler.execute_now().await.unwrap();
    assert!(first.is_some());
    let status = scheduler.status();
    assert_eq!(status.total_executions, 1);
    assert_eq!(status.failed_executions, 0);
    assert!(status.last_execution.is_some());
    // The status surface reports the id the tick actually produced.
    assert_eq!(status.current_job_id, first);
}
