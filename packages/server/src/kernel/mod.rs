// Kernel - core infrastructure with dependency injection
//
// The ServerKernel holds all server dependencies (KV store, caches, job
// queue, provider API, webhooks) and provides dependency injection through
// traits for testability.
//
// IMPORTANT: Kernel is for INFRASTRUCTURE only, not business logic.
// Business logic belongs in domain layers.

pub mod cache;
pub mod codec;
pub mod jobs;
pub mod kv_store;
pub mod novita;
pub mod schedulers;
pub mod service_host;
pub mod server_kernel;
pub mod test_dependencies;
pub mod traits;
pub mod webhook;

pub use server_kernel::ServerKernel;
pub use service_host::{Service, ServiceHost};
pub use test_dependencies::{MemoryKvStore, MockProviderClient, SpyWebhookSender};
pub use traits::*;
pub use webhook::WebhookClient;
