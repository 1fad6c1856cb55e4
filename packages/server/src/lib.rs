// GPU Instance Control Plane - API Core
//
// This crate manages the lifecycle of GPU instances procured from the Novita
// cloud: creation, startup monitoring, spot-reclaim migration, auto-stop of
// idle instances, and webhook notification of callers.
//
// All durable state lives in Redis; work flows producer -> queue -> consumer
// (schedulers enqueue jobs, the queue worker dispatches them to handlers).

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use config::*;
