//! Idle-instance auto-stop.
//!
//! Stops instances that have been inactive past the threshold, while
//! respecting a startup grace period (measured from when the instance came
//! up) and a creation grace period (for instances that never came up).

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AutoStopConfig;
use crate::domains::instances::models::{InstanceState, InstanceStatus};
use crate::domains::instances::store::InstanceStore;
use crate::kernel::jobs::{Job, JobHandler, JobPayload};
use crate::kernel::traits::BaseProviderClient;

/// Counters returned by one auto-stop pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AutoStopOutcome {
    #[serde(rename = "totalChecked")]
    pub total_checked: usize,
    #[serde(rename = "eligibleForStop")]
    pub eligible_for_stop: usize,
    pub stopped: usize,
    pub errors: usize,
    #[serde(rename = "executionTimeMs")]
    pub execution_time_ms: u64,
}

/// Whether an instance should be stopped for inactivity.
pub fn eligible_for_stop(
    state: &InstanceState,
    now: DateTime<Utc>,
    config: &AutoStopConfig,
) -> bool {
    let ts = &state.timestamps;

    match ts.ready.or(ts.started) {
        Some(up_since) => {
            // Freshly started instances get time to be used.
            let up_minutes = now.signed_duration_since(up_since).num_minutes();
            if up_minutes < config.startup_grace_minutes {
                return false;
            }
        }
        None => {
            // Never came up: give creation its grace, then treat as stuck.
            let age_minutes = now.signed_duration_since(ts.created).num_minutes();
            return age_minutes >= config.creation_grace_minutes;
        }
    }

    let last_activity = ts
        .last_used
        .or(ts.ready)
        .or(ts.started)
        .unwrap_or(ts.created);
    let idle_minutes = now.signed_duration_since(last_activity).num_minutes();
    idle_minutes >= config.inactivity_threshold_minutes
}

pub struct AutoStopCheckHandler {
    store: InstanceStore,
    provider: Arc<dyn BaseProviderClient>,
    config: AutoStopConfig,
}

impl AutoStopCheckHandler {
    pub fn new(
        store: InstanceStore,
        provider: Arc<dyn BaseProviderClient>,
        config: AutoStopConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    async fn check(&self) -> Result<AutoStopOutcome> {
        let started = Utc::now();
        let mut outcome = AutoStopOutcome::default();
        let now = Utc::now();

        for mut state in self.store.all().await? {
            // Terminal instances have nothing to stop.
            if matches!(
                state.status,
                InstanceStatus::Stopped | InstanceStatus::Failed | InstanceStatus::Exited
            ) {
                continue;
            }
            outcome.total_checked += 1;

            if !eligible_for_stop(&state, now, &self.config) {
                continue;
            }
            outcome.eligible_for_stop += 1;

            if self.config.dry_run_mode {
                info!(instance_id = %state.id, "dry run: would stop idle instance");
                continue;
            }

            let Some(novita_id) = state.novita_instance_id.clone() else {
                debug!(instance_id = %state.id, "no provider id, cannot stop");
                continue;
            };

            // Clear last_used before stopping so a racing keep-alive write is
            // not silently discarded with the stop.
            state.timestamps.last_used = None;
            self.store.save(&state).await?;

            match self.provider.stop_instance(&novita_id).await {
                Ok(()) => {
                    state.status = InstanceStatus::Stopped;
                    self.store.save(&state).await?;
                    outcome.stopped += 1;
                    info!(instance_id = %state.id, novita_instance_id = %novita_id,
                        "stopped idle instance");
                }
                Err(e) => {
                    outcome.errors += 1;
                    warn!(instance_id = %state.id, error = %e, "failed to stop idle instance");
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
impl JobHandler for AutoStopCheckHandler {
    async fn execute(&self, job: &Job) -> Result<()> {
        let JobPayload::AutoStopCheck(_) = &job.payload else {
            bail!("AutoStopCheck handler received mismatched payload");
        };

        let outcome = self.check().await?;
        info!(
            total_checked = outcome.total_checked,
            eligible_for_stop = outcome.eligible_for_stop,
            stopped = outcome.stopped,
            errors = outcome.errors,
            execution_time_ms = outcome.execution_time_ms,
            "auto-stop check finished"
        );
        Ok(())
    }
}
