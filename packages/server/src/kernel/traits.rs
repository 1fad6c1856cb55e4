// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no business logic.
// Business logic (eligibility rules, resolvers) lives in domain modules that
// consume these traits.
//
// Naming convention: Base* for trait names (e.g., BaseProviderClient)

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use novita_client::{
    CreateInstanceRequest, CreateInstanceResponse, InstanceData, ListInstancesResponse,
    MigrateResponse, Product, ProductFilters, RegistryAuth, Template,
};

use crate::common::WebhookPayload;

// =============================================================================
// Provider Client Trait (Infrastructure - GPU cloud API)
// =============================================================================

/// The Provider API surface consumed by workflow handlers and startup sync.
///
/// Errors are the classified [`novita_client::NovitaError`] taxonomy so
/// callers can decide retry vs fail without string matching.
#[async_trait]
pub trait BaseProviderClient: Send + Sync {
    async fn list_products(&self, filters: &ProductFilters) -> novita_client::Result<Vec<Product>>;

    async fn get_template(&self, template_id: &str) -> novita_client::Result<Template>;

    async fn get_registry_auth(&self, auth_id: &str) -> novita_client::Result<RegistryAuth>;

    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> novita_client::Result<CreateInstanceResponse>;

    async fn get_instance(&self, instance_id: &str) -> novita_client::Result<InstanceData>;

    async fn start_instance(&self, instance_id: &str) -> novita_client::Result<()>;

    async fn stop_instance(&self, instance_id: &str) -> novita_client::Result<()>;

    async fn delete_instance(&self, instance_id: &str) -> novita_client::Result<()>;

    async fn list_instances(
        &self,
        page: i64,
        page_size: i64,
        status: Option<&str>,
    ) -> novita_client::Result<ListInstancesResponse>;

    async fn migrate_instance(&self, instance_id: &str) -> novita_client::Result<MigrateResponse>;
}

// =============================================================================
// Webhook Sender Trait (Infrastructure - caller notification)
// =============================================================================

#[async_trait]
pub trait BaseWebhookSender: Send + Sync {
    /// POST the payload as JSON to `url`. Any 2xx is success; everything else
    /// is an error so the queue can retry delivery.
    async fn send(
        &self,
        url: &str,
        payload: &WebhookPayload,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<()>;
}
