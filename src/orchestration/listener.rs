//! # Task Listener
//!
//! Owns one `LISTEN` connection to the task store and republishes its
//! notifications as [`TaskEvent`]s on an in-process broadcast. Also carries
//! the store primitives shared by the processor and the scheduler: task
//! creation, status updates, single task lookup, logs, groups and `wait`.

use crate::config::ListenerConfig;
use crate::constants::channels::{channel_for, CHANNEL_PREFIX, CHANNEL_SEPARATOR};
use crate::constants::task_types;
use crate::error::{Result, SchedulerError};
use crate::logging::log_task_operation;
use crate::models::{CreateTaskParams, Task, TaskEvent, TaskLog, TaskRelation};
use crate::orchestration::context::TaskGroup;
use crate::state_machine::{LogSeverity, TaskStatus};
use serde_json::{json, Value};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Clone)]
pub struct TaskListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    pool: PgPool,
    config: ListenerConfig,
    events: broadcast::Sender<TaskEvent>,
    subscription: Mutex<Option<Subscription>>,
}

struct Subscription {
    statuses: Vec<TaskStatus>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for TaskListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskListener")
            .field("subscribers", &self.inner.events.receiver_count())
            .finish()
    }
}

impl TaskListener {
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, ListenerConfig::default())
    }

    pub fn with_config(pool: PgPool, config: ListenerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer_size.max(1));
        Self {
            inner: Arc::new(ListenerInner {
                pool,
                config,
                events,
                subscription: Mutex::new(None),
            }),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    /// Receive every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn publish(&self, event: TaskEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Statuses currently listened to, empty when stopped
    pub async fn listening(&self) -> Vec<TaskStatus> {
        self.inner
            .subscription
            .lock()
            .await
            .as_ref()
            .map(|s| s.statuses.clone())
            .unwrap_or_default()
    }

    /// Listen to the channels of `statuses`, replacing any previous subscription.
    #[instrument(skip(self))]
    pub async fn start(&self, statuses: &[TaskStatus]) -> Result<()> {
        let mut subscription = self.inner.subscription.lock().await;
        if let Some(previous) = subscription.take() {
            debug!(statuses = ?previous.statuses, "Replacing existing subscription");
            previous.stop().await;
        }

        let mut statuses = statuses.to_vec();
        statuses.sort();
        statuses.dedup();
        let channels: Vec<String> = statuses.iter().copied().map(channel_for).collect();

        let listener = open_listener(&self.inner.pool, &channels)
            .await
            .map_err(|e| SchedulerError::ListenerError(format!("Failed to listen to {channels:?}: {e}")))?;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_notification_loop(
            listener,
            NotificationLoop {
                pool: self.inner.pool.clone(),
                channels: channels.clone(),
                statuses: statuses.clone(),
                events: self.inner.events.clone(),
                shutdown: shutdown.clone(),
                reconnect_delay: self.inner.config.reconnect_delay(),
            },
        ));

        info!(channels = ?channels, "Task listener started");
        *subscription = Some(Subscription {
            statuses,
            shutdown,
            handle,
        });
        Ok(())
    }

    /// Stop listening. Calling it while stopped is a no-op.
    pub async fn stop(&self) {
        if let Some(subscription) = self.inner.subscription.lock().await.take() {
            subscription.stop().await;
            info!("Task listener stopped");
        }
    }

    pub async fn create(
        &self,
        owner_scope: i64,
        user_id: Option<i64>,
        params: CreateTaskParams,
    ) -> Result<i64> {
        validate_params(&params)?;
        let task_id = Task::create(&self.inner.pool, owner_scope, user_id, &params).await?;
        log_task_operation(
            "create",
            task_id,
            Some(&params.task_type),
            params.status.as_str(),
            None,
        );
        Ok(task_id)
    }

    /// Create a task under `parent`, inheriting its owner scope and creator.
    pub async fn create_child(&self, parent: i64, params: CreateTaskParams) -> Result<i64> {
        validate_params(&params)?;
        let task_id = Task::create_child(&self.inner.pool, parent, &params)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("Parent task {parent} not found")))?;
        log_task_operation(
            "create_child",
            task_id,
            Some(&params.task_type),
            params.status.as_str(),
            Some(&format!("parent={parent}")),
        );
        Ok(task_id)
    }

    pub async fn set_status(&self, task_id: i64, status: TaskStatus) -> Result<()> {
        if !Task::set_status(&self.inner.pool, task_id, status).await? {
            return Err(SchedulerError::NotFound(format!("No task found with id {task_id}")));
        }
        debug!(task_id = task_id, status = %status, "Task status updated");
        Ok(())
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Task> {
        Task::find_by_id(&self.inner.pool, task_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("No task found with id {task_id}")))
    }

    /// Make `target` depend on `source`
    pub async fn add_relation(&self, source: i64, target: i64) -> Result<()> {
        TaskRelation::create(&self.inner.pool, source, target).await?;
        debug!(source = source, target = target, "Dependency added");
        Ok(())
    }

    pub async fn append_task_log(
        &self,
        task_id: i64,
        severity: LogSeverity,
        message: &str,
    ) -> Result<()> {
        TaskLog::append(&self.inner.pool, task_id, severity, message).await?;
        Ok(())
    }

    pub async fn get_task_logs(&self, task_id: i64, offset: i64, limit: i64) -> Result<Vec<TaskLog>> {
        Ok(TaskLog::list_for_task(&self.inner.pool, task_id, offset.max(0), limit).await?)
    }

    /// Build the error `wait()` rejects with for a failed task.
    ///
    /// Never fails: a store error while reading the log is published as a
    /// [`TaskEvent::ListenerError`] and folded into the message.
    pub async fn resolve_task_error(&self, task_id: i64) -> SchedulerError {
        let message = match TaskLog::last_error(&self.inner.pool, task_id).await {
            Ok(Some(line)) => format!("In task {task_id}: {line}"),
            Ok(None) => format!("In task {task_id}: no logs"),
            Err(e) => {
                warn!(task_id = task_id, error = %e, "Failed to read task error log");
                self.publish(TaskEvent::ListenerError {
                    message: format!("Failed to resolve error of task {task_id}: {e}"),
                });
                format!("In task {task_id}: failed to get log with error: {e}")
            }
        };
        SchedulerError::TaskFailed { task_id, message }
    }

    /// Create a group placeholder under `parent` and let `work` enumerate its
    /// dependencies. See [`TaskGroup`].
    pub async fn group<F, Fut>(&self, parent: i64, work: F) -> Result<i64>
    where
        F: FnOnce(TaskGroup) -> Fut + Send,
        Fut: Future<Output = Result<Vec<i64>>> + Send,
    {
        let group_id = self.create_child(parent, group_placeholder()).await?;
        self.populate_group(group_id, work).await
    }

    /// Same as [`TaskListener::group`] for a placeholder without parent.
    pub async fn root_group<F, Fut>(
        &self,
        owner_scope: i64,
        user_id: Option<i64>,
        work: F,
    ) -> Result<i64>
    where
        F: FnOnce(TaskGroup) -> Fut + Send,
        Fut: Future<Output = Result<Vec<i64>>> + Send,
    {
        let group_id = self.create(owner_scope, user_id, group_placeholder()).await?;
        self.populate_group(group_id, work).await
    }

    async fn populate_group<F, Fut>(&self, group_id: i64, work: F) -> Result<i64>
    where
        F: FnOnce(TaskGroup) -> Fut + Send,
        Fut: Future<Output = Result<Vec<i64>>> + Send,
    {
        let group = TaskGroup::new(self.clone(), group_id);
        let populated = async {
            let ids = work(group.clone()).await?;
            for id in ids {
                group.attach(id).await?;
            }
            Ok::<_, SchedulerError>(())
        }
        .await;

        match populated {
            Ok(()) => {
                debug!(group_id = group_id, dependencies = ?group.attached(), "Group ready for processing");
                self.set_status(group_id, TaskStatus::Pending).await?;
                Ok(group_id)
            }
            Err(e) => {
                error!(group_id = group_id, error = %e, "Group initialization failed");
                let message = format!("Group initialization failed: {e}");
                if let Err(log_err) = self.append_task_log(group_id, LogSeverity::Error, &message).await {
                    warn!(group_id = group_id, error = %log_err, "Failed to save group error log");
                }
                if let Err(status_err) = self.set_status(group_id, TaskStatus::Error).await {
                    warn!(group_id = group_id, error = %status_err, "Failed to mark group as failed");
                }
                Err(e)
            }
        }
    }

    /// Wait for `task_id` to settle.
    ///
    /// Resolves with the task output, following chained outputs (an integer
    /// output naming another task) until a task outputs something else or its
    /// own id. Rejects with [`SchedulerError::TaskFailed`] if any task on the
    /// chain fails, with [`SchedulerError::NotFound`] if the chain names a
    /// missing task and with [`SchedulerError::ValidationError`] if it loops
    /// back on a task already visited. Needs a subscription that includes
    /// `success` and `error`.
    pub async fn wait(&self, task_id: i64) -> Result<Value> {
        let mut visited = HashSet::from([task_id]);
        let mut current = task_id;
        loop {
            let output = self.wait_settled(current).await?;
            match chained_task(&output, current) {
                Some(next) if !visited.insert(next) => {
                    return Err(SchedulerError::ValidationError(format!(
                        "Chained outputs of task {task_id} loop back to task {next}"
                    )))
                }
                Some(next) => {
                    debug!(task_id = current, next = next, "Following chained output");
                    current = next;
                }
                None => return Ok(output),
            }
        }
    }

    async fn wait_settled(&self, task_id: i64) -> Result<Value> {
        // Subscribe before reading so a transition between the two is not lost
        let mut events = self.subscribe();
        loop {
            match Task::find_status(&self.inner.pool, task_id).await? {
                None => {
                    return Err(SchedulerError::NotFound(format!("No task found with id {task_id}")))
                }
                Some(status) if status.is_terminal() => {
                    if status == TaskStatus::Error {
                        return Err(self.resolve_task_error(task_id).await);
                    }
                    let task = self.get_task(task_id).await?;
                    return Ok(task.output.unwrap_or(Value::Null));
                }
                Some(_) => {}
            }

            loop {
                match events.recv().await {
                    Ok(event) if event.concerns(task_id) => break,
                    Ok(TaskEvent::Resync) => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(task_id = task_id, skipped = skipped, "Waiter lagged, re-reading status");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SchedulerError::ListenerError("Task event channel closed".to_string()))
                    }
                }
            }
        }
    }
}

impl Subscription {
    async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Notification loop terminated abnormally");
        }
    }
}

fn group_placeholder() -> CreateTaskParams {
    CreateTaskParams::new(task_types::GROUP_OUTPUTS, json!({})).with_status(TaskStatus::Initializing)
}

fn validate_params(params: &CreateTaskParams) -> Result<()> {
    if params.task_type.trim().is_empty() {
        return Err(SchedulerError::ValidationError("Task type must not be empty".to_string()));
    }
    if !matches!(params.status, TaskStatus::Pending | TaskStatus::Initializing) {
        return Err(SchedulerError::ValidationError(format!(
            "Tasks can only be created pending or initializing, got {}",
            params.status
        )));
    }
    Ok(())
}

/// Task referenced by a chained output, if `output` is one
fn chained_task(output: &Value, task_id: i64) -> Option<i64> {
    match output {
        Value::Number(n) => n.as_i64().filter(|next| *next != task_id),
        _ => None,
    }
}

/// Decode one notification, dropping anything malformed or unwanted.
pub(crate) fn parse_notification(
    channel: &str,
    payload: &str,
    statuses: &[TaskStatus],
) -> Option<TaskEvent> {
    let Ok(task_id) = payload.trim().parse::<i64>() else {
        warn!(channel = %channel, payload = %payload, "Invalid task ID in notification");
        return None;
    };
    let Some((prefix, status)) = channel.split_once(CHANNEL_SEPARATOR) else {
        warn!(channel = %channel, "Invalid task channel name");
        return None;
    };
    if prefix != CHANNEL_PREFIX {
        warn!(channel = %channel, "Invalid task channel name");
        return None;
    }
    let status = match status.parse::<TaskStatus>() {
        Ok(status) => status,
        Err(e) => {
            warn!(channel = %channel, error = %e, "Unknown status in channel name");
            return None;
        }
    };
    if !statuses.contains(&status) {
        debug!(channel = %channel, "Received unwanted notification");
        return None;
    }
    debug!(task_id = task_id, status = %status, "Task notification");
    Some(TaskEvent::status(task_id, status))
}

async fn open_listener(pool: &PgPool, channels: &[String]) -> std::result::Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener
        .listen_all(channels.iter().map(String::as_str))
        .await?;
    Ok(listener)
}

struct NotificationLoop {
    pool: PgPool,
    channels: Vec<String>,
    statuses: Vec<TaskStatus>,
    events: broadcast::Sender<TaskEvent>,
    shutdown: CancellationToken,
    reconnect_delay: Duration,
}

impl NotificationLoop {
    /// Open a fresh connection, retrying until it succeeds or shutdown.
    async fn reconnect(&self) -> Option<PgListener> {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
            match open_listener(&self.pool, &self.channels).await {
                Ok(listener) => {
                    info!(channels = ?self.channels, "Task listener reconnected");
                    return Some(listener);
                }
                Err(e) => warn!(error = %e, "Task listener reconnection failed"),
            }
        }
    }
}

async fn run_notification_loop(listener: PgListener, ctx: NotificationLoop) {
    let mut listener = Some(listener);
    loop {
        if listener.is_none() {
            match ctx.reconnect().await {
                Some(fresh) => {
                    listener = Some(fresh);
                    // Notifications sent while disconnected are gone
                    let _ = ctx.events.send(TaskEvent::Resync);
                }
                None => break,
            }
        }
        let Some(current) = listener.as_mut() else {
            break;
        };

        let received = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            received = current.try_recv() => received,
        };

        match received {
            Ok(Some(notification)) => {
                if let Some(event) =
                    parse_notification(notification.channel(), notification.payload(), &ctx.statuses)
                {
                    let _ = ctx.events.send(event);
                }
            }
            Ok(None) => {
                warn!("Task listener connection lost");
                listener = None;
            }
            Err(e) => {
                error!(error = %e, "Task listener stream error");
                let _ = ctx.events.send(TaskEvent::ListenerError {
                    message: e.to_string(),
                });
                listener = None;
            }
        }
    }

    if let Some(mut listener) = listener {
        if let Err(e) = listener.unlisten_all().await {
            debug!(error = %e, "Failed to unlisten task channels");
        }
    }
    debug!("Notification loop ended");
}
