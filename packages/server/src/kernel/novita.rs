//! Novita client adapter for the provider trait.
//!
//! Workflow handlers consume [`BaseProviderClient`]; this adapter delegates
//! to the `novita-client` crate so no domain code depends on reqwest.

use async_trait::async_trait;
use novita_client::{
    CreateInstanceRequest, CreateInstanceResponse, InstanceData, ListInstancesResponse,
    MigrateResponse, NovitaClient, Product, ProductFilters, RegistryAuth, Template,
};

use super::traits::BaseProviderClient;
use crate::config::NovitaConfig;

/// Build the production provider client from configuration.
pub fn build_provider_client(config: &NovitaConfig) -> novita_client::Result<NovitaClient> {
    match &config.base_url {
        Some(base_url) => NovitaClient::with_base_url(config.api_key.clone(), base_url.clone()),
        None => NovitaClient::new(config.api_key.clone()),
    }
}

#[async_trait]
impl BaseProviderClient for NovitaClient {
    async fn list_products(&self, filters: &ProductFilters) -> novita_client::Result<Vec<Product>> {
        NovitaClient::list_products(self, filters).await
    }

    async fn get_template(&self, template_id: &str) -> novita_client::Result<Template> {
        NovitaClient::get_template(self, template_id).await
    }

    async fn get_registry_auth(&self, auth_id: &str) -> novita_client::Result<RegistryAuth> {
        NovitaClient::get_registry_auth(self, auth_id).await
    }

    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> novita_client::Result<CreateInstanceResponse> {
        NovitaClient::create_instance(self, request).await
    }

    async fn get_instance(&self, instance_id: &str) -> novita_client::Result<InstanceData> {
        NovitaClient::get_instance(self, instance_id).await
    }

    async fn start_instance(&self, instance_id: &str) -> novita_client::Result<()> {
        NovitaClient::start_instance(self, instance_id).await
    }

    async fn stop_instance(&self, instance_id: &str) -> novita_client::Result<()> {
        NovitaClient::stop_instance(self, instance_id).await
    }

    async fn delete_instance(&self, instance_id: &str) -> novita_client::Result<()> {
        NovitaClient::delete_instance(self, instance_id).await
    }

    async fn list_instances(
        &self,
        page: i64,
        page_size: i64,
        status: Option<&str>,
    ) -> novita_client::Result<ListInstancesResponse> {
        NovitaClient::list_instances(self, page, page_size, status).await
    }

    async fn migrate_instance(&self, instance_id: &str) -> novita_client::Result<MigrateResponse> {
        NovitaClient::migrate_instance(self, instance_id).await
    }
}
