//! # Task Scheduler
//!
//! Control plane for callers outside the worker pool: root task creation,
//! groups, listings, trees, logs, deletion, abort, and `wait`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use scene_tasks::models::CreateTaskParams;
//! use scene_tasks::orchestration::TaskScheduler;
//! use serde_json::json;
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> scene_tasks::error::Result<()> {
//! let scheduler = TaskScheduler::new(pool);
//! scheduler.start().await?;
//!
//! let id = scheduler
//!     .create(1, None, CreateTaskParams::new("delayTask", json!({"time": 0})))
//!     .await?;
//! let output = scheduler.wait(id).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{ListenerConfig, LogsConfig};
use crate::error::{Result, SchedulerError};
use crate::models::{CreateTaskParams, Task, TaskEvent, TaskListQuery, TaskLog, TaskTreeNode};
use crate::orchestration::context::TaskGroup;
use crate::orchestration::listener::TaskListener;
use crate::state_machine::TaskStatus;
use serde_json::Value;
use sqlx::PgPool;
use std::future::Future;
use tokio::sync::broadcast;
use tracing::{info, instrument};

/// Log line recorded when a task is aborted before any processor claimed it
pub const ABORTED_BEFORE_START: &str = "aborted before start";

/// Statuses a scheduler listens to
pub const SCHEDULER_EVENTS: [TaskStatus; 2] = [TaskStatus::Success, TaskStatus::Error];

#[derive(Debug, Clone)]
pub struct TaskScheduler {
    listener: TaskListener,
    logs: LogsConfig,
}

impl TaskScheduler {
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, ListenerConfig::default(), LogsConfig::default())
    }

    pub fn with_config(pool: PgPool, listener: ListenerConfig, logs: LogsConfig) -> Self {
        Self {
            listener: TaskListener::with_config(pool, listener),
            logs,
        }
    }

    pub fn listener(&self) -> &TaskListener {
        &self.listener
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.listener.subscribe()
    }

    /// Listen to task completions. Required before [`TaskScheduler::wait`].
    pub async fn start(&self) -> Result<()> {
        self.listener.start(&SCHEDULER_EVENTS).await
    }

    pub async fn stop(&self) {
        self.listener.stop().await
    }

    pub async fn create(
        &self,
        owner_scope: i64,
        user_id: Option<i64>,
        params: CreateTaskParams,
    ) -> Result<i64> {
        self.listener.create(owner_scope, user_id, params).await
    }

    pub async fn create_child(&self, parent: i64, params: CreateTaskParams) -> Result<i64> {
        self.listener.create_child(parent, params).await
    }

    /// Root group: a placeholder task whose dependencies `work` enumerates
    pub async fn group<F, Fut>(&self, owner_scope: i64, user_id: Option<i64>, work: F) -> Result<i64>
    where
        F: FnOnce(TaskGroup) -> Fut + Send,
        Fut: Future<Output = Result<Vec<i64>>> + Send,
    {
        self.listener.root_group(owner_scope, user_id, work).await
    }

    /// Group placeholder created under `parent`
    pub async fn group_under<F, Fut>(&self, parent: i64, work: F) -> Result<i64>
    where
        F: FnOnce(TaskGroup) -> Fut + Send,
        Fut: Future<Output = Result<Vec<i64>>> + Send,
    {
        self.listener.group(parent, work).await
    }

    pub async fn add_relation(&self, source: i64, target: i64) -> Result<()> {
        self.listener.add_relation(source, target).await
    }

    pub async fn wait(&self, task_id: i64) -> Result<Value> {
        self.listener.wait(task_id).await
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Task> {
        self.listener.get_task(task_id).await
    }

    /// Root tasks matching `query`, newest first, each with its full tree
    #[instrument(skip(self))]
    pub async fn get_tasks(&self, query: &TaskListQuery) -> Result<Vec<TaskTreeNode>> {
        if query.limit <= 0 || query.offset < 0 {
            return Err(SchedulerError::ValidationError(format!(
                "Invalid pagination: limit {} offset {}",
                query.limit, query.offset
            )));
        }
        Ok(TaskTreeNode::list_roots(self.listener.pool(), query).await?)
    }

    /// Subtree rooted at `task_id`
    pub async fn get_task_tree(&self, task_id: i64) -> Result<TaskTreeNode> {
        TaskTreeNode::find_subtree(self.listener.pool(), task_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("No task found with id {task_id}")))
    }

    /// Full tree of the root `task_id` descends from
    pub async fn get_root_tree(&self, task_id: i64) -> Result<TaskTreeNode> {
        let root = TaskTreeNode::find_root_id(self.listener.pool(), task_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("No task found with id {task_id}")))?;
        self.get_task_tree(root).await
    }

    /// One page of a task's log; `limit` defaults and is clamped per [`LogsConfig`]
    pub async fn get_task_logs(
        &self,
        task_id: i64,
        offset: i64,
        limit: Option<i64>,
    ) -> Result<Vec<TaskLog>> {
        self.listener
            .get_task_logs(task_id, offset, self.logs.page_size(limit))
            .await
    }

    /// Delete a task with its edges, logs and children. Returns whether it existed.
    pub async fn delete_task(&self, task_id: i64) -> Result<bool> {
        let deleted = Task::delete(self.listener.pool(), task_id).await?;
        if deleted {
            info!(task_id = task_id, "Task deleted");
        }
        Ok(deleted)
    }

    /// Request cancellation of a task.
    ///
    /// A running task moves to `aborting` and its processor cancels the
    /// handler signal. A task that has not started fails immediately.
    /// Returns the new status, or `None` when the task had already settled.
    #[instrument(skip(self))]
    pub async fn abort(&self, task_id: i64) -> Result<Option<TaskStatus>> {
        let status = Task::abort(self.listener.pool(), task_id, ABORTED_BEFORE_START).await?;
        match status {
            Some(TaskStatus::Error) => info!(task_id = task_id, "Queued task aborted"),
            Some(status) => info!(task_id = task_id, status = %status, "Abort requested"),
            None => {
                if Task::find_status(self.listener.pool(), task_id).await?.is_none() {
                    return Err(SchedulerError::NotFound(format!("No task found with id {task_id}")));
                }
            }
        }
        Ok(status)
    }
}
