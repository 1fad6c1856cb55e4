//! Failed-migration retry sweep.
//!
//! Symmetric to the spot-migration sweep, but targets instances whose last
//! migration attempt failed and whose cooldown (tracked in the
//! migration-times store) has elapsed. Runs at twice the migration interval.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use novita_client::InstanceData;
use tracing::{debug, info, warn};

use super::migrate::{evaluate_eligibility, migrate_with_retry, SweepOutcome};
use crate::config::{InstanceListingConfig, MigrationConfig};
use crate::domains::instances::listing::list_instances_with_fallback;
use crate::domains::instances::migration_times::MigrationTimeStore;
use crate::domains::instances::store::InstanceStore;
use crate::kernel::jobs::{Job, JobHandler, JobPayload};
use crate::kernel::traits::BaseProviderClient;

pub struct HandleFailedMigrationsHandler {
    store: InstanceStore,
    provider: Arc<dyn BaseProviderClient>,
    migration_times: MigrationTimeStore,
    config: MigrationConfig,
    listing: InstanceListingConfig,
}

impl HandleFailedMigrationsHandler {
    pub fn new(
        store: InstanceStore,
        provider: Arc<dyn BaseProviderClient>,
        migration_times: MigrationTimeStore,
        config: MigrationConfig,
        listing: InstanceListingConfig,
    ) -> Self {
        Self {
            store,
            provider,
            migration_times,
            config,
            listing,
        }
    }

    /// Cooldown between re-migration attempts: twice the sweep interval, the
    /// same relationship the failed-migration scheduler has to the migration
    /// scheduler.
    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.config.schedule_interval_ms * 2)
    }

    async fn sweep(&self) -> Result<SweepOutcome> {
        let started = Utc::now();
        let mut outcome = SweepOutcome::default();

        let instances = list_instances_with_fallback(
            self.provider.as_ref(),
            &self.store,
            self.listing.enable_fallback_to_local,
        )
        .await?;

        let candidates: Vec<&InstanceData> = instances
            .iter()
            .filter(|instance| instance.status == "exited")
            .filter(|instance| evaluate_eligibility(instance).eligible)
            .collect();

        for instance in candidates {
            outcome.total_processed += 1;

            // Only instances with a recorded failed attempt belong to this
            // sweep; fresh reclaims are the migration sweep's job.
            let Some(last_attempt) = self.migration_times.last_attempt(&instance.id).await? else {
                outcome.skipped += 1;
                continue;
            };
            if !self
                .migration_times
                .cooldown_elapsed(&instance.id, self.cooldown())
                .await?
            {
                debug!(instance_id = %instance.id, last_attempt = %last_attempt,
                    "cooldown not elapsed, skipping");
                outcome.skipped += 1;
                continue;
            }

            if self.config.dry_run_mode {
                info!(instance_id = %instance.id, "dry run: would re-migrate");
                outcome.skipped += 1;
                continue;
            }

            match migrate_with_retry(self.provider.as_ref(), &instance.id).await {
                Ok(()) => {
                    outcome.migrated += 1;
                    self.migration_times.record(&instance.id).await?;
                    info!(instance_id = %instance.id, "failed migration retried successfully");
                }
                Err(e) => {
                    outcome.errors += 1;
                    self.migration_times.record(&instance.id).await?;
                    warn!(instance_id = %instance.id, error = %e, "re-migration failed");
                }
            }
        }

        outcome.execution_time_ms = Utc::now()
            .signed_duration_since(started)
            .num_milliseconds()
            .max(0) as u64;
        Ok(outcome)
    }
}

#[async_trait]
impl JobHandler for HandleFailedMigrationsHandler {
    async fn execute(&self, job: &Job) -> Result<()> {
        let JobPayload::HandleFailedMigrations(_) = &job.payload else {
            bail!("HandleFailedMigrations handler received mismatched payload");
        };

        let outcome = self.sweep().await?;
        info!(
            total_processed = outcome.total_processed,
            migrated = outcome.migrated,
            skipped = outcome.skipped,
            errors = outcome.errors,
            execution_time_ms = outcome.execution_time_ms,
            "failed-migration sweep finished"
        );
        Ok(())
    }
}
