//! # Handler Context
//!
//! Everything a handler receives for one execution: the claimed task, the
//! outputs of its dependencies, a persisted logger, the cancellation signal
//! and a sub-task API that parents every created task to the running one.

use crate::error::{Result, SchedulerError};
use crate::logging::TASK_LOG_TARGET;
use crate::models::{CreateTaskParams, Task};
use crate::orchestration::listener::TaskListener;
use crate::state_machine::LogSeverity;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Opaque domain services injected by the embedding application
pub type Services = Arc<dyn Any + Send + Sync>;

pub struct TaskHandlerContext {
    pub task: Task,
    /// Outputs of the tasks in `task.after`, keyed by task id
    pub inputs: BTreeMap<i64, Value>,
    pub logger: TaskLogger,
    /// Cancelled when the task is aborted or the processor stops
    pub signal: CancellationToken,
    pub tasks: TaskSpawner,
    services: Option<Services>,
}

impl TaskHandlerContext {
    pub(crate) fn new(
        task: Task,
        inputs: BTreeMap<i64, Value>,
        listener: TaskListener,
        signal: CancellationToken,
        services: Option<Services>,
    ) -> Self {
        let task_id = task.task_id;
        Self {
            task,
            inputs,
            logger: TaskLogger::new(listener.clone(), task_id),
            signal,
            tasks: TaskSpawner::new(listener, task_id),
            services,
        }
    }

    pub fn task_id(&self) -> i64 {
        self.task.task_id
    }

    /// Deserialize the task payload
    pub fn data<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.task.data.clone()).map_err(|e| {
            SchedulerError::ValidationError(format!(
                "Invalid data for {} task {}: {e}",
                self.task.task_type, self.task.task_id
            ))
        })
    }

    /// Injected services of type `T`, if any were provided
    pub fn services<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.services.clone()?.downcast::<T>().ok()
    }

    /// Dependency outputs ordered by dependency id
    pub fn input_values(&self) -> Vec<Value> {
        self.inputs.values().cloned().collect()
    }
}

/// Logger whose lines are stored against one task and mirrored to `tracing`.
///
/// Store failures are reported through `tracing` and otherwise ignored, so a
/// broken log never fails the handler.
#[derive(Debug, Clone)]
pub struct TaskLogger {
    listener: TaskListener,
    task_id: i64,
}

impl TaskLogger {
    fn new(listener: TaskListener, task_id: i64) -> Self {
        Self { listener, task_id }
    }

    pub async fn debug(&self, message: impl AsRef<str>) {
        self.write(LogSeverity::Debug, message.as_ref()).await
    }

    pub async fn log(&self, message: impl AsRef<str>) {
        self.write(LogSeverity::Log, message.as_ref()).await
    }

    pub async fn warn(&self, message: impl AsRef<str>) {
        self.write(LogSeverity::Warn, message.as_ref()).await
    }

    pub async fn error(&self, message: impl AsRef<str>) {
        self.write(LogSeverity::Error, message.as_ref()).await
    }

    async fn write(&self, severity: LogSeverity, message: &str) {
        let task_id = self.task_id;
        match severity {
            LogSeverity::Debug => tracing::debug!(target: TASK_LOG_TARGET, task_id, "{message}"),
            LogSeverity::Log => tracing::info!(target: TASK_LOG_TARGET, task_id, "{message}"),
            LogSeverity::Warn => tracing::warn!(target: TASK_LOG_TARGET, task_id, "{message}"),
            LogSeverity::Error => tracing::error!(target: TASK_LOG_TARGET, task_id, "{message}"),
        }
        if let Err(e) = self.listener.append_task_log(task_id, severity, message).await {
            warn!(task_id = task_id, error = %e, "Failed to save task log line");
        }
    }
}

/// Creates tasks as children of one parent task
#[derive(Debug, Clone)]
pub struct TaskSpawner {
    listener: TaskListener,
    parent: i64,
}

impl TaskSpawner {
    pub(crate) fn new(listener: TaskListener, parent: i64) -> Self {
        Self { listener, parent }
    }

    pub fn parent_id(&self) -> i64 {
        self.parent
    }

    pub async fn create(&self, params: CreateTaskParams) -> Result<i64> {
        self.listener.create_child(self.parent, params).await
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Task> {
        self.listener.get_task(task_id).await
    }

    pub async fn wait(&self, task_id: i64) -> Result<Value> {
        self.listener.wait(task_id).await
    }

    /// Create a group under the parent; see [`TaskGroup`].
    pub async fn group<F, Fut>(&self, work: F) -> Result<i64>
    where
        F: FnOnce(TaskGroup) -> Fut + Send,
        Fut: Future<Output = Result<Vec<i64>>> + Send,
    {
        self.listener.group(self.parent, work).await
    }
}

/// Builder handed to a group callback.
///
/// The group placeholder stays `initializing` while the callback runs. Tasks
/// created through the builder are children of the placeholder; its
/// dependencies are the ids passed to [`TaskGroup::attach`] as they stream in
/// plus the ids the callback returns. Once the callback returns, the
/// placeholder becomes `pending` and eventually outputs the dependency outputs.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    tasks: TaskSpawner,
    attached: Arc<Mutex<BTreeSet<i64>>>,
}

impl TaskGroup {
    pub(crate) fn new(listener: TaskListener, group_id: i64) -> Self {
        Self {
            tasks: TaskSpawner::new(listener, group_id),
            attached: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Id of the placeholder task
    pub fn id(&self) -> i64 {
        self.tasks.parent
    }

    /// Create a child of the placeholder without attaching it
    pub async fn create(&self, params: CreateTaskParams) -> Result<i64> {
        self.tasks.create(params).await
    }

    /// Create a child of the placeholder and attach it as a dependency
    pub async fn create_attached(&self, params: CreateTaskParams) -> Result<i64> {
        let task_id = self.tasks.create(params).await?;
        self.attach(task_id).await?;
        Ok(task_id)
    }

    /// Make the placeholder depend on `task_id`. Attaching twice is a no-op.
    pub async fn attach(&self, task_id: i64) -> Result<()> {
        if !self.attached.lock().insert(task_id) {
            return Ok(());
        }
        if let Err(e) = self.tasks.listener.add_relation(task_id, self.id()).await {
            self.attached.lock().remove(&task_id);
            return Err(e);
        }
        Ok(())
    }

    /// Dependencies attached so far, ascending
    pub fn attached(&self) -> Vec<i64> {
        self.attached.lock().iter().copied().collect()
    }

    /// Nested group under the placeholder
    pub async fn group<F, Fut>(&self, work: F) -> Result<i64>
    where
        F: FnOnce(TaskGroup) -> Fut + Send,
        Fut: Future<Output = Result<Vec<i64>>> + Send,
    {
        self.tasks.group(work).await
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Task> {
        self.tasks.get_task(task_id).await
    }

    pub async fn wait(&self, task_id: i64) -> Result<Value> {
        self.tasks.wait(task_id).await
    }
}
