//! # Task Handler Registry
//!
//! Static mapping from task `type` to the handler that executes it. The
//! processor only claims tasks whose type is registered here.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use scene_tasks::registry::HandlerRegistry;
//! use serde_json::json;
//!
//! let mut registry = HandlerRegistry::with_control_handlers();
//! registry.register_fn("bakeModel", |ctx| async move {
//!     ctx.logger.log("baking").await;
//!     Ok(json!({"baked": ctx.task_id()}))
//! });
//! ```

use crate::constants::task_types;
use crate::handlers;
use crate::orchestration::context::TaskHandlerContext;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Executes tasks of one type
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task. The returned value becomes the task output; an error
    /// (with its full chain) is logged against the task and fails it.
    async fn handle(&self, ctx: TaskHandlerContext) -> anyhow::Result<Value>;
}

type BoxedHandlerFn =
    Box<dyn Fn(TaskHandlerContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Adapter turning an async closure into a [`TaskHandler`]
pub struct FnHandler {
    handler: BoxedHandlerFn,
}

impl FnHandler {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(TaskHandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            handler: Box::new(move |ctx| handler(ctx).boxed()),
        }
    }
}

#[async_trait]
impl TaskHandler for FnHandler {
    async fn handle(&self, ctx: TaskHandlerContext) -> anyhow::Result<Value> {
        (self.handler)(ctx).await
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in control handlers
    pub fn with_control_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(task_types::DELAY, handlers::DelayTask);
        registry.register(task_types::ERROR, handlers::ErrorTask);
        registry.register(task_types::FOR_EACH, handlers::ForEachTask);
        registry.register(task_types::GROUP, handlers::GroupTask);
        registry.register(task_types::GROUP_OUTPUTS, handlers::GroupOutputsTask);
        registry.register(task_types::REDUCE, handlers::ReduceTasks);
        registry.register(task_types::AFTER_REDUCE, handlers::AfterReduceTasks);
        registry
    }

    /// Register `handler` for `task_type`, replacing any previous one
    pub fn register<H>(&mut self, task_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: TaskHandler + 'static,
    {
        let task_type = task_type.into();
        debug!(task_type = %task_type, "Registering task handler");
        self.handlers.insert(task_type, Arc::new(handler));
        self
    }

    pub fn register_fn<F, Fut>(&mut self, task_type: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(TaskHandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(task_type, FnHandler::new(handler))
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
