//! The four periodic producers.
//!
//! Migration and failed-migration sweeps dedupe against the queue before
//! enqueueing (a Pending or Processing job of the same type short-circuits
//! the tick and returns the in-flight id). The auto-stop check is idempotent
//! and ephemeral, so it skips dedup. Data cleanup does its work inline
//! rather than producing a job.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::periodic::SchedulerTask;
use crate::config::MigrationConfig;
use crate::kernel::jobs::{JobPayload, JobPriority, JobType, RedisJobQueue, SweepPayload};

const AUTO_STOP_INTERVAL: Duration = Duration::from_secs(120);
const DATA_CLEANUP_CYCLE_SECS: i64 = 3 * 3600;

/// Produces `MigrateSpotInstances` sweeps.
pub struct MigrationSweepTask {
    queue: Arc<RedisJobQueue>,
    config: MigrationConfig,
}

impl MigrationSweepTask {
    pub fn new(queue: Arc<RedisJobQueue>, config: MigrationConfig) -> Self {
        Self { queue, config }
    }
}

#[async_trait]
impl SchedulerTask for MigrationSweepTask {
    fn name(&self) -> &'static str {
        "migration-scheduler"
    }

    fn next_delay(&self) -> Duration {
        Duration::from_millis(self.config.schedule_interval_ms)
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn execute(&self) -> Result<Option<String>> {
        if let Some(active) = self.queue.find_active(JobType::MigrateSpotInstances).await? {
            debug!(job_id = %active.id, "migration sweep already in flight, skipping");
            return Ok(Some(active.id));
        }
        let max_attempts = if self.config.retry_failed_migrations {
            3
        } else {
            1
        };
        let id = self
            .queue
            .add(
                JobPayload::MigrateSpotInstances(SweepPayload::now()),
                JobPriority::Normal,
                Some(max_attempts),
            )
            .await?;
        Ok(Some(id))
    }
}

/// Produces `HandleFailedMigrations` sweeps at twice the migration interval.
pub struct FailedMigrationSweepTask {
    queue: Arc<RedisJobQueue>,
    config: MigrationConfig,
}

impl FailedMigrationSweepTask {
    pub fn new(queue: Arc<RedisJobQueue>, config: MigrationConfig) -> Self {
        Self { queue, config }
    }
}

#[async_trait]
impl SchedulerTask for FailedMigrationSweepTask {
    fn name(&self) -> &'static str {
        "failed-migration-scheduler"
    }

    fn next_delay(&self) -> Duration {
        Duration::from_millis(self.config.schedule_interval_ms * 2)
    }

    fn enabled(&self) -> bool {
        self.config.enabled && self.config.retry_failed_migrations
    }

    async fn execute(&self) -> Result<Option<String>> {
        if let Some(active) = self
            .queue
            .find_active(JobType::HandleFailedMigrations)
            .await?
        {
            debug!(job_id = %active.id, "failed-migration sweep already in flight, skipping");
            return Ok(Some(active.id));
        }
        let id = self
            .queue
            .add(
                JobPayload::HandleFailedMigrations(SweepPayload::now()),
                JobPriority::Normal,
                Some(1),
            )
            .await?;
        Ok(Some(id))
    }
}

/// Produces ephemeral `AutoStopCheck` jobs every two minutes. The check is
/// idempotent, so no dedup is needed.
pub struct AutoStopSweepTask {
    queue: Arc<RedisJobQueue>,
}

impl AutoStopSweepTask {
    pub fn new(queue: Arc<RedisJobQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl SchedulerTask for AutoStopSweepTask {
    fn name(&self) -> &'static str {
        "auto-stop-scheduler"
    }

    fn next_delay(&self) -> Duration {
        AUTO_STOP_INTERVAL
    }

    async fn execute(&self) -> Result<Option<String>> {
        let id = self
            .queue
            .add(
                JobPayload::AutoStopCheck(SweepPayload::now()),
                JobPriority::Normal,
                Some(1),
            )
            .await?;
        Ok(Some(id))
    }
}

/// Garbage-collects orphaned `jobs:data:job_*` records every three hours,
/// aligned to the UTC hour.
pub struct DataCleanupTask {
    queue: Arc<RedisJobQueue>,
}

impl DataCleanupTask {
    pub fn new(queue: Arc<RedisJobQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl SchedulerTask for DataCleanupTask {
    fn name(&self) -> &'static str {
        "data-cleanup-scheduler"
    }

    fn next_delay(&self) -> Duration {
        // Epoch is UTC-hour aligned, so 3h cycles from epoch land on hours
        // 0, 3, 6, ... Delay to the next cycle boundary.
        let now = chrono::Utc::now().timestamp();
        let into_cycle = now.rem_euclid(DATA_CLEANUP_CYCLE_SECS);
        let remaining = DATA_CLEANUP_CYCLE_SECS - into_cycle;
        Duration::from_secs(remaining as u64)
    }

    async fn execute(&self) -> Result<Option<String>> {
        let removed = self.queue.cleanup_orphaned_data().await?;
        debug!(removed, "data cleanup pass finished");
        Ok(None)
    }
}
