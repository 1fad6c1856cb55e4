// Shared types and helpers used across layers (no circular dependency)

pub mod ids;
pub mod types;

pub use ids::{instance_id, job_id};
pub use types::WebhookPayload;
