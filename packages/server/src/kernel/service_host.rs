//! Long-running service hosting with graceful shutdown.
//!
//! A [`Service`] is a background loop (queue worker, scheduler, cache
//! maintenance) owning its own cadence. The [`ServiceHost`] spawns every
//! registered service, waits for SIGINT/SIGTERM, cancels the shared root
//! token, and joins the services within a grace period.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A long-running background service.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run until the shutdown token is cancelled. Implementations must check
    /// the token between units of work and exit promptly once cancelled.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Hosts a set of services until process shutdown.
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    grace_period: Duration,
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            grace_period: Duration::from_secs(30),
        }
    }

    pub fn with_service(mut self, service: impl Service + 'static) -> Self {
        self.services.push(Box::new(service));
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Run all services until a shutdown signal arrives, then cancel and join
    /// them within the grace period.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let root = CancellationToken::new();
        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        for service in self.services {
            let name = service.name();
            let token = root.child_token();
            let handle = tokio::spawn(async move {
                if let Err(e) = service.run(token).await {
                    error!(service = name, error = %e, "service exited with error");
                }
            });
            info!(service = name, "service started");
            handles.push((name, handle));
        }

        wait_for_shutdown_signal().await;
        info!("shutdown signal received, stopping services");
        root.cancel();

        let join_all = async {
            for (name, handle) in handles {
                if let Err(e) = handle.await {
                    error!(service = name, error = %e, "service task panicked");
                }
            }
        };
        if tokio::time::timeout(self.grace_period, join_all).await.is_err() {
            warn!(
                grace_secs = self.grace_period.as_secs(),
                "services did not stop within the grace period"
            );
        }

        info!("all services stopped");
        Ok(())
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
