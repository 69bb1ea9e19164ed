//! Task handlers and the type-to-handler registry

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::error::HandlerError;
use super::task::TaskInfo;

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn process_task(&self, task: TaskInfo) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`TaskHandler`]
pub struct HandlerFn<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(TaskInfo) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for HandlerFn<F>
where
    F: Fn(TaskInfo) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn process_task(&self, task: TaskInfo) -> Result<(), HandlerError> {
        (self.0)(task).await
    }
}

/// Routes tasks to handlers by task type
#[derive(Default, Clone)]
pub struct ServeMux {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `task_type`, replacing any previous one
    pub fn handle(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        if self.handlers.insert(task_type.clone(), handler).is_some() {
            tracing::warn!(task_type = %task_type, "Handler replaced");
        }
    }

    pub fn handle_fn<F, Fut>(&mut self, task_type: impl Into<String>, f: F)
    where
        F: Fn(TaskInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.handle(task_type, Arc::new(handler_fn(f)));
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
