//! Periodic scheduler template.
//!
//! Each scheduler owns an independent timer that is re-armed after every tick
//! completes, success or failure, so one crashing tick cannot stall the
//! cadence. Ticks produce jobs (deduped against the queue) or perform direct
//! maintenance; the work itself lives in a [`SchedulerTask`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::kernel::service_host::Service;

/// Failure ratio above which a scheduler with enough history is unhealthy.
const UNHEALTHY_FAILURE_RATIO: f64 = 0.5;
const UNHEALTHY_MIN_EXECUTIONS: u64 = 10;

/// One scheduler's work: cadence plus the tick body.
#[async_trait]
pub trait SchedulerTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// Delay until the next tick, evaluated after each tick completes.
    fn next_delay(&self) -> Duration;

    fn enabled(&self) -> bool {
        true
    }

    /// Execute one tick. Returns the produced (or deduplicated in-flight)
    /// job id, when the tick produces a job.
    async fn execute(&self) -> Result<Option<String>>;
}

/// Point-in-time scheduler state.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub enabled: bool,
    #[serde(rename = "lastExecution")]
    pub last_execution: Option<DateTime<Utc>>,
    #[serde(rename = "nextExecution")]
    pub next_execution: Option<DateTime<Utc>>,
    #[serde(rename = "totalExecutions")]
    pub total_executions: u64,
    #[serde(rename = "failedExecutions")]
    pub failed_executions: u64,
    /// Id of the job produced (or found in flight) by the latest tick.
    #[serde(rename = "currentJobId")]
    pub current_job_id: Option<String>,
    /// Seconds since the scheduler started, 0 when stopped.
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerHealth {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Default)]
struct State {
    running: bool,
    shutting_down: bool,
    /// True while a tick body is executing; shutdown drains on this.
    tick_in_flight: bool,
    last_execution: Option<DateTime<Utc>>,
    next_execution: Option<DateTime<Utc>>,
    total_executions: u64,
    failed_executions: u64,
    /// Id of the job produced (or found in flight) by the latest tick.
    current_job_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
}

/// Drives a [`SchedulerTask`] on its own timer.
pub struct PeriodicScheduler {
    task: Arc<dyn SchedulerTask>,
    state: Mutex<State>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl PeriodicScheduler {
    pub fn new(task: Arc<dyn SchedulerTask>) -> Arc<Self> {
        Arc::new(Self {
            task,
            state: Mutex::new(State::default()),
            cancel: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &'static str {
        self.task.name()
    }

    /// Start the tick loop. Idempotent: a running scheduler is left alone.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return;
            }
            state.running = true;
            state.shutting_down = false;
            state.started_at = Some(Utc::now());
        }

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap() = Some(token.clone());

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            info!(scheduler = scheduler.name(), "scheduler started");
            loop {
                let delay = scheduler.task.next_delay();
                scheduler.state.lock().unwrap().next_execution = Some(
                    Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                );

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if token.is_cancelled() {
                    break;
                }

                if !scheduler.task.enabled() {
                    debug!(scheduler = scheduler.name(), "disabled, skipping tick");
                    continue;
                }

                // Errors are swallowed here so the timer always re-arms.
                if let Err(e) = scheduler.run_tick().await {
                    error!(scheduler = scheduler.name(), error = %e, "tick failed");
                }
            }
            // A quick stop-then-start replaces the token in `cancel`; only
            // clear the flags when no newer loop has taken over.
            if scheduler.cancel.lock().unwrap().is_none() {
                let mut state = scheduler.state.lock().unwrap();
                state.running = false;
                state.next_execution = None;
            }
            info!(scheduler = scheduler.name(), "scheduler stopped");
        });
    }

    /// Stop the tick loop without waiting for an in-flight tick.
    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().unwrap().take() {
            token.cancel();
        }
        let mut state = self.state.lock().unwrap();
        state.running = false;
        state.next_execution = None;
    }

    /// Stop, then wait up to `timeout` for any in-flight tick to clear.
    pub async fn shutdown(&self, timeout: Duration) {
        self.state.lock().unwrap().shutting_down = true;
        self.stop();

        let deadline = tokio::time::Instant::now() + timeout;
        while self.state.lock().unwrap().tick_in_flight {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    scheduler = self.name(),
                    "shutdown timed out waiting for in-flight tick"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Run one tick immediately, outside the timer cadence.
    pub async fn execute_now(&self) -> Result<Option<String>> {
        self.run_tick().await
    }

    async fn run_tick(&self) -> Result<Option<String>> {
        {
            let mut state = self.state.lock().unwrap();
            state.total_executions += 1;
            state.last_execution = Some(Utc::now());
            state.tick_in_flight = true;
            state.current_job_id = None;
        }

        let result = self.task.execute().await;

        let mut state = self.state.lock().unwrap();
        state.tick_in_flight = false;
        match result {
            Ok(job_id) => {
                state.current_job_id = job_id.clone();
                if let Some(id) = &job_id {
                    debug!(scheduler = self.name(), job_id = %id, "tick produced job");
                }
                Ok(job_id)
            }
            Err(e) => {
                state.failed_executions += 1;
                Err(e)
            }
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.state.lock().unwrap();
        let uptime_secs = state
            .started_at
            .filter(|_| state.running)
            .map(|at| Utc::now().signed_duration_since(at).num_seconds().max(0) as u64)
            .unwrap_or(0);
        SchedulerStatus {
            running: state.running,
            enabled: self.task.enabled(),
            last_execution: state.last_execution,
            next_execution: state.next_execution,
            total_executions: state.total_executions,
            failed_executions: state.failed_executions,
            current_job_id: state.current_job_id.clone(),
            uptime_secs,
        }
    }

    pub fn health(&self) -> SchedulerHealth {
        let state = self.state.lock().unwrap();
        if state.shutting_down {
            return SchedulerHealth::Unhealthy;
        }
        if !self.task.enabled() {
            // Intentionally idle.
            return SchedulerHealth::Healthy;
        }
        if !state.running {
            return SchedulerHealth::Unhealthy;
        }
        if state.total_executions >= UNHEALTHY_MIN_EXECUTIONS {
            let ratio = state.failed_executions as f64 / state.total_executions as f64;
            if ratio > UNHEALTHY_FAILURE_RATIO {
                return SchedulerHealth::Unhealthy;
            }
        }
        SchedulerHealth::Healthy
    }
}

/// Adapter so a scheduler can run under the [`ServiceHost`].
///
/// [`ServiceHost`]: crate::kernel::service_host::ServiceHost
pub struct SchedulerService {
    scheduler: Arc<PeriodicScheduler>,
    shutdown_timeout: Duration,
}

impl SchedulerService {
    pub fn new(scheduler: Arc<PeriodicScheduler>) -> Self {
        Self {
            scheduler,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl Service for SchedulerService {
    fn name(&self) -> &'static str {
        self.scheduler.name()
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        self.scheduler.start();
        shutdown.cancelled().await;
        self.scheduler.shutdown(self.shutdown_timeout).await;
        Ok(())
    }
}
