//! Template lookup and validation.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use novita_client::Template;

use crate::kernel::cache::Cache;
use crate::kernel::jobs::NonRetryableError;
use crate::kernel::traits::BaseProviderClient;

const VALID_PORT_TYPES: [&str; 4] = ["tcp", "udp", "http", "https"];

pub struct TemplateResolver {
    provider: Arc<dyn BaseProviderClient>,
    cache: Arc<Cache>,
}

impl TemplateResolver {
    pub fn new(provider: Arc<dyn BaseProviderClient>, cache: Arc<Cache>) -> Self {
        Self { provider, cache }
    }

    /// Fetch and validate a template. Valid templates are cached for the
    /// cache's default TTL (ten minutes).
    pub async fn resolve(&self, template_id: &str) -> Result<Template> {
        if let Some(template) = self.cache.get::<Template>(template_id).await? {
            return Ok(template);
        }

        let template = self
            .provider
            .get_template(template_id)
            .await
            .with_context(|| format!("template fetch failed for {}", template_id))?;

        validate_template(&template)?;
        self.cache.set(template_id, &template).await?;
        Ok(template)
    }
}

/// Reject malformed templates before anything is provisioned from them.
/// Validation failures are permanent; the job must not retry.
pub fn validate_template(template: &Template) -> Result<()> {
    if template.id.is_empty() {
        bail!(NonRetryableError("template has empty id".to_string()));
    }
    if template.image_url.is_empty() {
        bail!(NonRetryableError(format!(
            "template {} has empty imageUrl",
            template.id
        )));
    }
    for port in &template.ports {
        if !(1..=65535).contains(&port.port) {
            bail!(NonRetryableError(format!(
                "template {} has out-of-range port {}",
                template.id, port.port
            )));
        }
        if !VALID_PORT_TYPES.contains(&port.port_type.as_str()) {
            bail!(NonRetryableError(format!(
                "template {} has invalid port type \"{}\"",
                template.id, port.port_type
            )));
        }
    }
    for env in &template.envs {
        if env.key.is_empty() {
            bail!(NonRetryableError(format!(
                "template {} has env var with empty key",
                template.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use novita_client::{EnvVar, TemplatePort};

    fn template() -> Template {
        Template {
            id: "t1".to_string(),
            image_url: "registry.example.com/img:latest".to_string(),
            image_auth: None,
            ports: vec![TemplatePort {
                port: 8080,
                port_type: "http".to_string(),
            }],
            envs: vec![EnvVar {
                key: "MODE".to_string(),
                value: "prod".to_string(),
            }],
        }
    }

    #[test]
    fn test_valid_template_passes() {
        assert!(validate_template(&template()).is_ok());
    }

    #[test]
    fn test_rejects_empty_image_url() {
        let mut t = template();
        t.image_url.clear();
        assert!(validate_template(&t).is_err());
    }

    #[test]
    fn test_rejects_bad_port() {
        let mut t = template();
        t.ports[0].port = 0;
        assert!(validate_template(&t).is_err());
        t.ports[0].port = 70000;
        assert!(validate_template(&t).is_err());
    }

    #[test]
    fn test_rejects_bad_port_type() {
        let mut t = template();
        t.ports[0].port_type = "sctp".to_string();
        assert!(validate_template(&t).is_err());
    }

    #[test]
    fn test_rejects_empty_env_key() {
        let mut t = template();
        t.envs[0].key.clear();
        assert!(validate_template(&t).is_err());
    }
}
