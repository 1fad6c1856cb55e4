// ServerKernel - core infrastructure with all dependencies
//
// The ServerKernel holds all server dependencies (KV store, caches, queue,
// provider API, webhook sender) and provides access via traits for
// testability. It is built once in main and read-only thereafter.

use std::sync::Arc;

use super::cache::CacheManager;
use super::jobs::RedisJobQueue;
use super::kv_store::KvStore;
use super::traits::{BaseProviderClient, BaseWebhookSender};
use crate::config::Config;

/// ServerKernel holds all server dependencies
pub struct ServerKernel {
    pub config: Config,
    pub kv: Arc<dyn KvStore>,
    pub caches: Arc<CacheManager>,
    pub job_queue: Arc<RedisJobQueue>,
    pub provider: Arc<dyn BaseProviderClient>,
    pub webhooks: Arc<dyn BaseWebhookSender>,
}

impl ServerKernel {
    /// Creates a new ServerKernel with the given dependencies
    pub fn new(
        config: Config,
        kv: Arc<dyn KvStore>,
        caches: Arc<CacheManager>,
        job_queue: Arc<RedisJobQueue>,
        provider: Arc<dyn BaseProviderClient>,
        webhooks: Arc<dyn BaseWebhookSender>,
    ) -> Self {
        Self {
            config,
            kv,
            caches,
            job_queue,
            provider,
            webhooks,
        }
    }
}
