//! Instance creation entry point.
//!
//! The synchronous half of instance creation: persist the initial state and
//! enqueue the `CreateInstance` job. The HTTP layer (or a test) calls this;
//! everything after is queue-driven.

use anyhow::Result;

use super::models::InstanceState;
use super::store::InstanceStore;
use crate::common::ids;
use crate::kernel::jobs::{CreateInstancePayload, JobPayload, JobPriority, RedisJobQueue};

#[derive(Debug, Clone)]
pub struct CreateInstanceParams {
    pub name: String,
    pub product_name: String,
    pub template_id: String,
    pub gpu_num: i64,
    pub rootfs_size: i64,
    pub region: String,
    pub webhook_url: Option<String>,
}

/// Accept a creation request: write the initial state record and enqueue the
/// workflow. Returns `(instance_id, job_id)`.
pub async fn request_instance_creation(
    store: &InstanceStore,
    queue: &RedisJobQueue,
    params: CreateInstanceParams,
) -> Result<(String, String)> {
    let instance_id = ids::instance_id();

    let mut state = InstanceState::new(&instance_id, &params.name);
    state.webhook_url = params.webhook_url.clone();
    store.save(&state).await?;

    let job_id = queue
        .add(
            JobPayload::CreateInstance(CreateInstancePayload {
                instance_id: instance_id.clone(),
                name: params.name,
                product_name: params.product_name,
                template_id: params.template_id,
                gpu_num: params.gpu_num,
                rootfs_size: params.rootfs_size,
                region: params.region,
                webhook_url: params.webhook_url,
            }),
            JobPriority::High,
            None,
        )
        .await?;

    Ok((instance_id, job_id))
}
