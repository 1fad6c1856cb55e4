//! Pure Novita GPU instance REST API client.
//!
//! A minimal client for the Novita GPU cloud API. Supports product and
//! template lookup, instance lifecycle calls (create/start/stop/delete),
//! paginated instance listing, and spot-instance migration.
//!
//! # Example
//!
//! ```rust,ignore
//! use novita_client::{NovitaClient, ProductFilters};
//!
//! let client = NovitaClient::new("your-api-key".into())?;
//!
//! let products = client
//!     .list_products(&ProductFilters {
//!         product_name: Some("RTX 4090 24GB".into()),
//!         region: Some("CN-HK-01".into()),
//!     })
//!     .await?;
//! ```

pub mod error;
pub mod types;

pub use error::{NovitaError, Result};
pub use types::{
    CreateInstanceRequest, CreateInstanceResponse, EnvVar, InstanceData, ListInstancesResponse,
    MigrateResponse, Product, ProductFilters, RegistryAuth, Template, TemplatePort,
};

use std::time::Duration;

use serde::de::DeserializeOwned;
use types::ApiResponse;

const DEFAULT_BASE_URL: &str = "https://api.novita.ai/gpu-instance/openapi";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct NovitaClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl NovitaClient {
    /// Create a client against the default API endpoint.
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    /// Create a client against a custom endpoint (staging, tests).
    pub fn with_base_url(api_key: String, base_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| NovitaError::Unknown(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    /// List GPU SKUs matching the given filters.
    pub async fn list_products(&self, filters: &ProductFilters) -> Result<Vec<Product>> {
        let mut req = self
            .client
            .get(format!("{}/v1/products", self.base_url))
            .bearer_auth(&self.api_key);

        if let Some(name) = &filters.product_name {
            req = req.query(&[("productName", name.as_str())]);
        }
        if let Some(region) = &filters.region {
            req = req.query(&[("region", region.as_str())]);
        }

        let resp: ApiResponse<Vec<Product>> = self.execute(req).await?;
        Ok(resp.data)
    }

    /// Fetch a template by id.
    pub async fn get_template(&self, template_id: &str) -> Result<Template> {
        let req = self
            .client
            .get(format!("{}/v1/template", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[("templateId", template_id)]);

        let resp: ApiResponse<Template> = self.execute(req).await?;
        Ok(resp.data)
    }

    /// Fetch registry credentials for a private image.
    pub async fn get_registry_auth(&self, auth_id: &str) -> Result<RegistryAuth> {
        let req = self
            .client
            .get(format!("{}/v1/repository/auth", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[("authId", auth_id)]);

        let resp: ApiResponse<RegistryAuth> = self.execute(req).await?;
        Ok(resp.data)
    }

    /// Create a GPU instance. Returns the provider instance id.
    pub async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> Result<CreateInstanceResponse> {
        let req = self
            .client
            .post(format!("{}/v1/gpu/instance/create", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request);

        let resp: ApiResponse<CreateInstanceResponse> = self.execute(req).await?;
        Ok(resp.data)
    }

    /// Fetch a single instance by provider id.
    pub async fn get_instance(&self, instance_id: &str) -> Result<InstanceData> {
        let req = self
            .client
            .get(format!("{}/v1/gpu/instance", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[("instanceId", instance_id)]);

        let resp: ApiResponse<InstanceData> = self.execute(req).await?;
        Ok(resp.data)
    }

    /// Start a stopped instance.
    pub async fn start_instance(&self, instance_id: &str) -> Result<()> {
        self.instance_action("start", instance_id).await
    }

    /// Stop a running instance.
    pub async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        self.instance_action("stop", instance_id).await
    }

    /// Delete an instance.
    pub async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        self.instance_action("delete", instance_id).await
    }

    /// List instances, one page at a time.
    pub async fn list_instances(
        &self,
        page: i64,
        page_size: i64,
        status: Option<&str>,
    ) -> Result<ListInstancesResponse> {
        let mut req = self
            .client
            .get(format!("{}/v1/gpu/instances", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[("pageNum", page), ("pageSize", page_size)]);

        if let Some(status) = status {
            req = req.query(&[("status", status)]);
        }

        let resp: ApiResponse<ListInstancesResponse> = self.execute(req).await?;
        Ok(resp.data)
    }

    /// Migrate a reclaimed spot instance to fresh capacity.
    pub async fn migrate_instance(&self, instance_id: &str) -> Result<MigrateResponse> {
        let req = self
            .client
            .post(format!("{}/v1/gpu/instance/migrate", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "instanceId": instance_id }));

        let resp: ApiResponse<MigrateResponse> = self.execute(req).await?;
        Ok(resp.data)
    }

    async fn instance_action(&self, action: &str, instance_id: &str) -> Result<()> {
        let req = self
            .client
            .post(format!("{}/v1/gpu/instance/{}", self.base_url, action))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "instanceId": instance_id }));

        let resp = req.send().await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    /// Send a request and decode a JSON body, mapping non-2xx to the taxonomy.
    async fn execute<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let resp = req.send().await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.json::<T>().await?)
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let retry_after_ms = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000);

        let body = resp.text().await.unwrap_or_default();
        tracing::debug!(status = status.as_u16(), body = %body, "Novita API error response");

        Err(NovitaError::from_status(status.as_u16(), body, retry_after_ms))
    }
}
