//! Spot-reclaim migration sweep.
//!
//! Walks every provider instance, picks out the exited ones, applies the
//! eligibility rules, and migrates each eligible instance with bounded
//! retries. The odd provider behavior around "invalid state change" (the
//! migration already happened server-side) is coerced to success by
//! re-reading the instance after a short wait.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use novita_client::{InstanceData, NovitaError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{InstanceListingConfig, MigrationConfig};
use crate::domains::instances::listing::list_instances_with_fallback;
use crate::domains::instances::migration_times::MigrationTimeStore;
use crate::domains::instances::store::InstanceStore;
use crate::kernel::jobs::{Job, JobHandler, JobPayload, RedisJobQueue, WorkflowStep};
use crate::kernel::traits::BaseProviderClient;

const MIGRATE_ATTEMPTS: u32 = 3;
const MIGRATE_BASE_BACKOFF: Duration = Duration::from_secs(1);
const INVALID_STATE_RECHECK_DELAY: Duration = Duration::from_secs(2);

/// Verdict for one exited instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationEligibility {
    pub eligible: bool,
    pub reason: &'static str,
}

/// The eligibility rule set, in evaluation order.
pub fn evaluate_eligibility(instance: &InstanceData) -> MigrationEligibility {
    let gpu_ids = instance.gpu_ids.as_deref();
    if gpu_ids == Some(&[1]) {
        return MigrationEligibility {
            eligible: false,
            reason: "gpuIds [1] - no migration",
        };
    }
    if gpu_ids == Some(&[2]) {
        return MigrationEligibility {
            eligible: true,
            reason: "gpuIds [2] - migration required",
        };
    }

    let spot_status_empty = instance
        .spot_status
        .as_deref()
        .map(str::is_empty)
        .unwrap_or(true);
    let reclaim_time = instance.spot_reclaim_time.as_deref();

    if spot_status_empty && reclaim_time == Some("0") {
        return MigrationEligibility {
            eligible: false,
            reason: "no spot reclaim pending",
        };
    }
    if let Some(reclaim) = reclaim_time {
        if !reclaim.is_empty() && reclaim != "0" {
            return MigrationEligibility {
                eligible: true,
                reason: "spot reclaim detected",
            };
        }
    }
    MigrationEligibility {
        eligible: false,
        reason: "not eligible",
    }
}

/// Migrate one instance with retry, classifying errors per attempt.
///
/// Retryable transport errors (timeout, network, 5xx, circuit open) back off
/// exponentially; a rate-limit hint overrides the backoff. A 400 "invalid
/// state change" triggers a re-read: if the instance is already
/// starting/running, the migration happened and the call is a success.
pub async fn migrate_with_retry(
    provider: &dyn BaseProviderClient,
    instance_id: &str,
) -> Result<()> {
    let mut last_error = String::new();

    for attempt in 1..=MIGRATE_ATTEMPTS {
        match provider.migrate_instance(instance_id).await {
            Ok(response) if response.is_success() => {
                debug!(
                    instance_id = %instance_id,
                    new_instance_id = ?response.new_instance_id,
                    attempt,
                    "migration accepted"
                );
                return Ok(());
            }
            Ok(response) => {
                last_error = response
                    .error
                    .unwrap_or_else(|| "provider reported failure".to_string());
                warn!(instance_id = %instance_id, attempt, error = %last_error, "migration rejected");
            }
            Err(NovitaError::BadRequest(message))
                if message.contains("invalid state change") =>
            {
                tokio::time::sleep(INVALID_STATE_RECHECK_DELAY).await;
                let current = provider.get_instance(instance_id).await?;
                if matches!(current.status.as_str(), "starting" | "running") {
                    debug!(instance_id = %instance_id, status = %current.status,
                        "instance already moving after invalid state change, treating as success");
                    return Ok(());
                }
                bail!(
                    "migration of {} rejected with invalid state change (status {})",
                    instance_id,
                    current.status
                );
            }
            Err(e) if e.is_retryable() => {
                let delay = match &e {
                    NovitaError::RateLimited {
                        retry_after_ms: Some(ms),
                    } => Duration::from_millis(*ms),
                    _ => MIGRATE_BASE_BACKOFF * 2u32.pow(attempt - 1),
                };
                last_error = e.to_string();
                warn!(instance_id = %instance_id, attempt, delay_ms = delay.as_millis() as u64,
                    error = %last_error, "transient migration error, backing off");
                if attempt < MIGRATE_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => bail!("migration of {} failed permanently: {}", instance_id, e),
        }
    }
    bail!(
        "migration of {} failed after {} attempts: {}",
        instance_id,
        MIGRATE_ATTEMPTS,
        last_error
    )
}

/// Counters returned by one sweep.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepOutcome {
    #[serde(rename = "totalProcessed")]
    pub total_processed: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub errors: usize,
    #[serde(rename = "executionTimeMs")]
    pub execution_time_ms: u64,
}

pub struct MigrateSpotInstancesHandler {
    store: InstanceStore,
    provider: Arc<dyn BaseProviderClient>,
    migration_times: MigrationTimeStore,
    queue: Arc<RedisJobQueue>,
    config: MigrationConfig,
    listing: InstanceListingConfig,
}

impl MigrateSpotInstancesHandler {
    pub fn new(
        store: InstanceStore,
        provider: Arc<dyn BaseProviderClient>,
        migration_times: MigrationTimeStore,
        queue: Arc<RedisJobQueue>,
        config: MigrationConfig,
        listing: InstanceListingConfig,
    ) -> Self {
        Self {
            store,
            provider,
            migration_times,
            queue,
            config,
            listing,
        }
    }

    async fn sweep(&self, job: &Job) -> Result<SweepOutcome> {
        let started = Utc::now();
        let mut outcome = SweepOutcome::default();

        // Fresh listing, bypassing the instance cache.
        let instances = list_instances_with_fallback(
            self.provider.as_ref(),
            &self.store,
            self.listing.enable_fallback_to_local,
        )
        .await?;

        let exited: Vec<&InstanceData> = instances
            .iter()
            .filter(|instance| instance.status == "exited")
            .collect();
        outcome.total_processed = exited.len();

        let mut eligible = Vec::new();
        for instance in exited {
            let verdict = evaluate_eligibility(instance);
            if verdict.eligible {
                eligible.push(instance);
            } else {
                outcome.skipped += 1;
                debug!(instance_id = %instance.id, reason = verdict.reason, "skipping instance");
                let _ = self
                    .queue
                    .append_step(
                        &job.id,
                        WorkflowStep::ok(format!("skip {}: {}", instance.id, verdict.reason)),
                    )
                    .await;
            }
        }

        // Bounded concurrency: migrate in chunks of max_concurrent_migrations.
        let chunk_size = self.config.max_concurrent_migrations.max(1);
        for chunk in eligible.chunks(chunk_size) {
            let results = futures::future::join_all(chunk.iter().map(|instance| async {
                if self.config.dry_run_mode {
                    info!(instance_id = %instance.id, "dry run: would migrate");
                    return (instance.id.clone(), Ok(true));
                }
                match migrate_with_retry(self.provider.as_ref(), &instance.id).await {
                    Ok(()) => (instance.id.clone(), Ok(false)),
                    Err(e) => (instance.id.clone(), Err(e)),
                }
            }))
            .await;

            for (instance_id, result) in results {
                match result {
                    Ok(dry_run) => {
                        if dry_run {
                            outcome.skipped += 1;
                        } else {
                            outcome.migrated += 1;
                            self.migration_times.record(&instance_id).await?;
                            let _ = self
                                .queue
                                .append_step(
                                    &job.id,
                                    WorkflowStep::ok(format!("migrated {}", instance_id)),
                                )
                                .await;
                        }
                    }
                    Err(e) => {
                        outcome.errors += 1;
                        // Stamp the failed attempt for the cooldown sweep.
                        self.migration_times.record(&instance_id).await?;
                        warn!(instance_id = %instance_id, error = %e, "migration failed");
                        let _ = self
                            .queue
                            .append_step(
                                &job.id,
                                WorkflowStep::failed(
                                    format!("migrate {}", instance_id),
                                    e.to_string(),
                                ),
                            )
                            .await;
                    }
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
impl JobHandler for MigrateSpotInstancesHandler {
    async fn execute(&self, job: &Job) -> Result<()> {
        let JobPayload::MigrateSpotInstances(_) = &job.payload else {
            bail!("MigrateSpotInstances handler received mismatched payload");
        };

        let outcome = self.sweep(job).await?;
        info!(
            total_processed = outcome.total_processed,
            migrated = outcome.migrated,
            skipped = outcome.skipped,
            errors = outcome.errors,
            execution_time_ms = outcome.execution_time_ms,
            "spot migration sweep finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(
        gpu_ids: Option<Vec<i64>>,
        spot_status: Option<&str>,
        reclaim: Option<&str>,
    ) -> InstanceData {
        InstanceData {
            id: "i1".to_string(),
            name: "n".to_string(),
            status: "exited".to_string(),
            gpu_ids,
            spot_status: spot_status.map(str::to_string),
            spot_reclaim_time: reclaim.map(str::to_string),
        }
    }

    #[test]
    fn test_gpu_ids_one_is_not_eligible() {
        let verdict = evaluate_eligibility(&exited(Some(vec![1]), None, None));
        assert!(!verdict.eligible);
        assert_eq!(verdict.reason, "gpuIds [1] - no migration");
    }

    #[test]
    fn test_gpu_ids_two_is_eligible() {
        let verdict = evaluate_eligibility(&exited(Some(vec![2]), None, None));
        assert!(verdict.eligible);
        assert_eq!(verdict.reason, "gpuIds [2] - migration required");
    }

    #[test]
    fn test_no_spot_signal_is_not_eligible() {
        let verdict = evaluate_eligibility(&exited(None, None, Some("0")));
        assert!(!verdict.eligible);

        let verdict = evaluate_eligibility(&exited(None, Some(""), Some("0")));
        assert!(!verdict.eligible);
    }

    #[test]
    fn test_reclaim_time_is_eligible() {
        let verdict = evaluate_eligibility(&exited(None, None, Some("1735689600")));
        assert!(verdict.eligible);
        assert_eq!(verdict.reason, "spot reclaim detected");

        // A non-empty spot status with a reclaim time is still eligible.
        let verdict = evaluate_eligibility(&exited(None, Some("reclaiming"), Some("1735689600")));
        assert!(verdict.eligible);
    }

    #[test]
    fn test_default_is_not_eligible() {
        let verdict = evaluate_eligibility(&exited(None, None, None));
        assert!(!verdict.eligible);

        // gpuIds other than [1]/[2] fall through to the spot rules.
        let verdict = evaluate_eligibility(&exited(Some(vec![1, 2]), None, None));
        assert!(!verdict.eligible);
    }
}
