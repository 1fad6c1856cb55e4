//! Handler registry: a straight map from job type to handler.
//!
//! Handlers are process-local. They receive the queue handle at construction
//! time (not through the registry), so a handler can enqueue follow-up jobs
//! without a circular module reference.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::job::{Job, JobType};

/// A consumer for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<()>;
}

/// Maps job types to their handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for this type; registration
    /// happens once at boot, so a duplicate is a wiring bug.
    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        if self.handlers.insert(job_type, handler).is_some() {
            panic!("handler already registered for job type: {}", job_type);
        }
    }

    pub fn get(&self, job_type: JobType) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(&job_type)
    }

    pub fn has(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::job::{JobPayload, JobPriority, SweepPayload};

    struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        async fn execute(&self, _job: &Job) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register(JobType::AutoStopCheck, Arc::new(NoopHandler));
        assert!(registry.has(JobType::AutoStopCheck));
        assert!(!registry.has(JobType::CreateInstance));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_registration_panics() {
        let mut registry = HandlerRegistry::new();
        registry.register(JobType::AutoStopCheck, Arc::new(NoopHandler));
        registry.register(JobType::AutoStopCheck, Arc::new(NoopHandler));
    }

    #[tokio::test]
    async fn test_handler_executes() {
        let mut registry = HandlerRegistry::new();
        registry.register(JobType::AutoStopCheck, Arc::new(NoopHandler));

        let job = Job::new(
            JobPayload::AutoStopCheck(SweepPayload::now()),
            JobPriority::Normal,
            1,
        );
        let handler = registry.get(job.job_type()).unwrap();
        assert!(handler.execute(&job).await.is_ok());
    }
}
