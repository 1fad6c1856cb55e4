//! Workflow handlers: the consumers behind each job type.
//!
//! Handlers hold their dependencies (store, resolvers, provider, queue) and
//! are registered into the [`HandlerRegistry`] at boot. A handler that needs
//! to enqueue follow-up work holds the queue handle directly; the queue only
//! knows the registry, so there is no circular reference.

mod auto_stop;
mod create;
mod failed;
mod migrate;
mod monitor;
mod webhook;

pub use auto_stop::AutoStopCheckHandler;
pub use create::CreateInstanceHandler;
pub use failed::HandleFailedMigrationsHandler;
pub use migrate::{evaluate_eligibility, MigrateSpotInstancesHandler, MigrationEligibility};
pub use monitor::MonitorInstanceHandler;
pub use webhook::SendWebhookHandler;

use std::sync::Arc;

use novita_client::NovitaError;

use super::migration_times::MigrationTimeStore;
use super::product_resolver::ProductResolver;
use super::store::InstanceStore;
use super::template_resolver::TemplateResolver;
use crate::kernel::jobs::{HandlerRegistry, JobType, NonRetryableError};
use crate::kernel::ServerKernel;

/// Lift a provider error into the job error model: retryable errors pass
/// through, permanent ones are tagged so the queue fails the job immediately.
pub(crate) fn classify_provider_error(error: NovitaError) -> anyhow::Error {
    if error.is_retryable() {
        anyhow::Error::new(error)
    } else {
        anyhow::Error::new(NonRetryableError(error.to_string()))
    }
}

/// Build every workflow handler from the kernel and register it.
pub fn register_all(kernel: &ServerKernel, registry: &mut HandlerRegistry) {
    let store = InstanceStore::new(kernel.caches.instances().clone());
    let products = Arc::new(ProductResolver::new(
        kernel.provider.clone(),
        kernel.caches.products().clone(),
    ));
    let templates = Arc::new(TemplateResolver::new(
        kernel.provider.clone(),
        kernel.caches.templates().clone(),
    ));
    let migration_times = MigrationTimeStore::new(kernel.caches.migration_times().clone());

    registry.register(
        JobType::CreateInstance,
        Arc::new(CreateInstanceHandler::new(
            store.clone(),
            products,
            templates,
            kernel.provider.clone(),
            kernel.job_queue.clone(),
        )),
    );
    registry.register(
        JobType::MonitorInstance,
        Arc::new(MonitorInstanceHandler::new(
            store.clone(),
            kernel.provider.clone(),
            kernel.job_queue.clone(),
            kernel.config.defaults.clone(),
        )),
    );
    registry.register(
        JobType::MigrateSpotInstances,
        Arc::new(MigrateSpotInstancesHandler::new(
            store.clone(),
            kernel.provider.clone(),
            migration_times.clone(),
            kernel.job_queue.clone(),
            kernel.config.migration.clone(),
            kernel.config.instance_listing.clone(),
        )),
    );
    registry.register(
        JobType::HandleFailedMigrations,
        Arc::new(HandleFailedMigrationsHandler::new(
            store.clone(),
            kernel.provider.clone(),
            migration_times,
            kernel.config.migration.clone(),
            kernel.config.instance_listing.clone(),
        )),
    );
    registry.register(
        JobType::AutoStopCheck,
        Arc::new(AutoStopCheckHandler::new(
            store,
            kernel.provider.clone(),
            kernel.config.auto_stop.clone(),
        )),
    );
    registry.register(
        JobType::SendWebhook,
        Arc::new(SendWebhookHandler::new(kernel.webhooks.clone())),
    );
}
