use serde::{Deserialize, Serialize};

/// Wrapper for Novita API responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// Filters for the product listing endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProductFilters {
    #[serde(rename = "productName", skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// A GPU SKU offered by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub region: String,
    /// "available" when the SKU can currently be provisioned.
    pub availability: String,
    #[serde(rename = "spotPrice")]
    pub spot_price: f64,
    #[serde(rename = "onDemandPrice")]
    pub on_demand_price: f64,
}

impl Product {
    pub fn is_available(&self) -> bool {
        self.availability == "available"
    }
}

/// A port exposed by an instance template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatePort {
    pub port: i64,
    #[serde(rename = "type")]
    pub port_type: String,
}

/// An environment variable declared by a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// An instance template: image plus launch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    #[serde(rename = "imageUrl")]
    pub image_url: String,
    /// Registry auth id; present when the image is private.
    #[serde(rename = "imageAuth", default, skip_serializing_if = "Option::is_none")]
    pub image_auth: Option<String>,
    #[serde(default)]
    pub ports: Vec<TemplatePort>,
    #[serde(default)]
    pub envs: Vec<EnvVar>,
}

/// Credentials for a private image registry.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

/// Request body for instance creation.
#[derive(Debug, Clone, Serialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    #[serde(rename = "productId")]
    pub product_id: String,
    #[serde(rename = "gpuNum")]
    pub gpu_num: i64,
    #[serde(rename = "rootfsSize")]
    pub rootfs_size: i64,
    #[serde(rename = "imageUrl")]
    pub image_url: String,
    #[serde(rename = "imageAuth", skip_serializing_if = "Option::is_none")]
    pub image_auth: Option<String>,
    /// Ports formatted `port/type`, comma-joined (e.g. "8080/http,22/tcp").
    pub ports: String,
    #[serde(default)]
    pub envs: Vec<EnvVar>,
    pub kind: String,
    #[serde(rename = "billingMode")]
    pub billing_mode: String,
}

/// Response from instance creation.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateInstanceResponse {
    pub id: String,
}

/// A provider-side instance as returned by get/list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceData {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Provider status string: creating, starting, running, exited, failed.
    pub status: String,
    #[serde(rename = "gpuIds", default, skip_serializing_if = "Option::is_none")]
    pub gpu_ids: Option<Vec<i64>>,
    #[serde(rename = "spotStatus", default, skip_serializing_if = "Option::is_none")]
    pub spot_status: Option<String>,
    /// Epoch-seconds string; "0" means no reclaim pending.
    #[serde(
        rename = "spotReclaimTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub spot_reclaim_time: Option<String>,
}

/// One page of the instance listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ListInstancesResponse {
    #[serde(default)]
    pub instances: Vec<InstanceData>,
    #[serde(default)]
    pub total: i64,
}

/// Response from a spot-instance migration call.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrateResponse {
    #[serde(rename = "newInstanceId", default)]
    pub new_instance_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl MigrateResponse {
    /// A migration succeeded when the provider reported no error.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_data_tolerates_missing_optional_fields() {
        let json = r#"{"id":"nov-1","status":"running"}"#;
        let inst: InstanceData = serde_json::from_str(json).unwrap();
        assert_eq!(inst.id, "nov-1");
        assert!(inst.gpu_ids.is_none());
        assert!(inst.spot_reclaim_time.is_none());
    }

    #[test]
    fn test_migrate_response_success() {
        let ok: MigrateResponse =
            serde_json::from_str(r#"{"newInstanceId":"nov-2"}"#).unwrap();
        assert!(ok.is_success());

        let err: MigrateResponse =
            serde_json::from_str(r#"{"error":"invalid state change"}"#).unwrap();
        assert!(!err.is_success());
    }
}
