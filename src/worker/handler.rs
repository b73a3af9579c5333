use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use crate::queue::Task;

/// Business logic for one task type.
///
/// The returned string is stored as the status result on success; an error's
/// message is stored (truncated) on failure.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> anyhow::Result<String>;
}

/// Notified by the executor as batches finish.
#[async_trait]
pub trait BatchListener: Send + Sync {
    async fn on_batch_complete(&self, trace_id: &str);
}

/// task_type -> handler, built before the pool starts and read-only after.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    fallback: Option<Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last registration for a type wins.
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(task_type.into(), handler);
        self
    }

    /// Used for task types nothing was registered for.
    pub fn set_fallback(&mut self, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.fallback = Some(handler);
        self
    }

    pub fn get(&self, task_type: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).or(self.fallback.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.fallback.is_none()
    }
}
