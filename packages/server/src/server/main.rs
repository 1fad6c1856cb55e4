//! Control plane entry point.
//!
//! Boot order: config -> tracing -> Redis -> kernel -> handler registration
//! -> startup sync -> services (queue worker, schedulers, cache maintenance)
//! under the service host until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use server_core::config::Config;
use server_core::domains::instances::handlers;
use server_core::domains::instances::{InstanceStore, StartupSync};
use server_core::kernel::cache::{CacheMaintenance, CacheManager};
use server_core::kernel::jobs::{HandlerRegistry, QueueConfig, QueueWorker, RedisJobQueue};
use server_core::kernel::kv_store::{KvStore, RedisKvStore};
use server_core::kernel::novita::build_provider_client;
use server_core::kernel::schedulers::{
    AutoStopSweepTask, DataCleanupTask, FailedMigrationSweepTask, MigrationSweepTask,
    PeriodicScheduler, SchedulerService,
};
use server_core::kernel::{ServerKernel, ServiceHost, WebhookClient};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;

    let kv: Arc<dyn KvStore> = Arc::new(
        RedisKvStore::connect(
            &config.redis.url,
            config.redis.key_prefix.clone(),
            Duration::from_millis(config.redis.connection_timeout_ms),
            Duration::from_millis(config.redis.command_timeout_ms),
            config.redis.retry_attempts,
            Duration::from_millis(config.redis.retry_delay_ms),
        )
        .await
        .context("failed to connect to Redis")?,
    );
    tracing::info!(url = %config.redis.url, "connected to Redis");

    let caches = Arc::new(CacheManager::new(kv.clone()));
    let job_queue = Arc::new(RedisJobQueue::new(kv.clone(), QueueConfig::default()));
    let provider = Arc::new(
        build_provider_client(&config.novita).context("failed to build provider client")?,
    );
    let webhooks = Arc::new(WebhookClient::new(config.webhook.timeout_ms)?);

    let kernel = ServerKernel::new(
        config.clone(),
        kv.clone(),
        caches.clone(),
        job_queue.clone(),
        provider,
        webhooks,
    );

    let mut registry = HandlerRegistry::new();
    handlers::register_all(&kernel, &mut registry);
    let registry = Arc::new(registry);

    // Reconcile the instance cache against the provider before serving.
    // Sync problems are logged, never fatal.
    let sync = StartupSync::new(
        kv.clone(),
        kernel.provider.clone(),
        InstanceStore::new(caches.instances().clone()),
    );
    let sync_result = sync.run().await;
    if !sync_result.errors.is_empty() {
        tracing::warn!(errors = ?sync_result.errors, "startup sync reported errors");
    }

    let migration = PeriodicScheduler::new(Arc::new(MigrationSweepTask::new(
        job_queue.clone(),
        config.migration.clone(),
    )));
    let failed_migration = PeriodicScheduler::new(Arc::new(FailedMigrationSweepTask::new(
        job_queue.clone(),
        config.migration.clone(),
    )));
    let auto_stop = PeriodicScheduler::new(Arc::new(AutoStopSweepTask::new(job_queue.clone())));
    let data_cleanup = PeriodicScheduler::new(Arc::new(DataCleanupTask::new(job_queue.clone())));

    ServiceHost::new()
        .with_service(QueueWorker::new(job_queue, registry))
        .with_service(CacheMaintenance::new(caches))
        .with_service(SchedulerService::new(migration))
        .with_service(SchedulerService::new(failed_migration))
        .with_service(SchedulerService::new(auto_stop))
        .with_service(SchedulerService::new(data_cleanup))
        .run_until_shutdown()
        .await
}
