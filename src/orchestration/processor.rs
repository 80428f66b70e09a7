//! # Task Processor
//!
//! The worker. Each processor owns a [`TaskListener`] subscribed to
//! `pending`, `aborting`, `success` and `error`, and executes one task at a
//! time. Parallelism comes from running several processors, in one process
//! or many; exclusivity rests only on the store's claim query.
//!
//! ## Lifecycle
//!
//! ```text
//! idle --(pending/success/resync)--> drain: claim -> execute -> claim -> ... -> idle
//! ```
//!
//! Wake-ups go through a [`SingleFlight`] guard, so notifications arriving
//! during a drain add at most one more drain.

use crate::constants::TaskStatus;
use crate::error::{Result, SchedulerError};
use crate::logging::log_task_operation;
use crate::models::{Task, TaskEvent};
use crate::orchestration::context::{Services, TaskHandlerContext};
use crate::orchestration::listener::TaskListener;
use crate::orchestration::single_flight::{SingleFlight, SingleFlightTrigger};
use crate::registry::HandlerRegistry;
use crate::state_machine::LogSeverity;
use serde_json::Value;
use sqlx::PgPool;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Statuses a processor listens to
pub const PROCESSOR_EVENTS: [TaskStatus; 4] = [
    TaskStatus::Pending,
    TaskStatus::Aborting,
    TaskStatus::Success,
    TaskStatus::Error,
];

#[derive(Clone)]
pub struct TaskProcessor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    processor_id: Uuid,
    listener: TaskListener,
    registry: Arc<HandlerRegistry>,
    services: Option<Services>,
    current: parking_lot::Mutex<Option<CurrentTask>>,
    runtime: Mutex<Option<ProcessorRuntime>>,
}

struct CurrentTask {
    task_id: i64,
    signal: CancellationToken,
}

struct ProcessorRuntime {
    shutdown: CancellationToken,
    poller: SingleFlight,
    events: JoinHandle<()>,
}

impl std::fmt::Debug for TaskProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskProcessor")
            .field("processor_id", &self.inner.processor_id)
            .field("current_task", &self.current_task())
            .finish()
    }
}

impl TaskProcessor {
    pub fn new(listener: TaskListener, registry: Arc<HandlerRegistry>) -> Self {
        Self::build(listener, registry, None)
    }

    /// Processor whose handlers can reach `services` through
    /// [`TaskHandlerContext::services`]
    pub fn with_services(listener: TaskListener, registry: Arc<HandlerRegistry>, services: Services) -> Self {
        Self::build(listener, registry, Some(services))
    }

    pub fn from_pool(pool: PgPool, registry: Arc<HandlerRegistry>) -> Self {
        Self::new(TaskListener::new(pool), registry)
    }

    fn build(listener: TaskListener, registry: Arc<HandlerRegistry>, services: Option<Services>) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                processor_id: Uuid::new_v4(),
                listener,
                registry,
                services,
                current: parking_lot::Mutex::new(None),
                runtime: Mutex::new(None),
            }),
        }
    }

    pub fn processor_id(&self) -> Uuid {
        self.inner.processor_id
    }

    pub fn listener(&self) -> &TaskListener {
        &self.inner.listener
    }

    /// Id of the task being executed, if any
    pub fn current_task(&self) -> Option<i64> {
        self.inner.current.lock().as_ref().map(|c| c.task_id)
    }

    /// Subscribe to notifications and drain the ready work. Idempotent.
    #[instrument(skip(self), fields(processor_id = %self.inner.processor_id))]
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.inner.runtime.lock().await;
        if runtime.is_some() {
            debug!("Processor already started");
            return Ok(());
        }

        let events = self.inner.listener.subscribe();
        self.inner.listener.start(&PROCESSOR_EVENTS).await?;

        let shutdown = CancellationToken::new();
        let poller = {
            let weak = Arc::downgrade(&self.inner);
            let shutdown = shutdown.clone();
            SingleFlight::spawn("task_processor", move || {
                let weak = weak.clone();
                let shutdown = shutdown.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.drain(&shutdown).await;
                    }
                }
            })
        };

        let events = tokio::spawn(run_event_loop(
            Arc::downgrade(&self.inner),
            events,
            poller.trigger_handle(),
            shutdown.clone(),
        ));

        // Work created while nobody was listening
        poller.trigger();

        info!(types = ?self.inner.registry.types(), "Task processor started");
        *runtime = Some(ProcessorRuntime {
            shutdown,
            poller,
            events,
        });
        Ok(())
    }

    /// Abort the current task, wait for it to settle and unsubscribe.
    #[instrument(skip(self), fields(processor_id = %self.inner.processor_id))]
    pub async fn stop(&self) {
        let Some(runtime) = self.inner.runtime.lock().await.take() else {
            return;
        };
        // Also cancels the signal of the task being executed
        runtime.shutdown.cancel();
        if let Err(e) = runtime.events.await {
            error!(error = %e, "Processor event loop terminated abnormally");
        }
        runtime.poller.shutdown().await;
        self.inner.listener.stop().await;
        info!("Task processor stopped");
    }

    /// Claim and execute ready tasks until none is left.
    ///
    /// Runs outside the single-flight guard; meant for tests and one-shot
    /// tools that do not call [`TaskProcessor::start`].
    pub async fn drain_once(&self) {
        self.inner.drain(&CancellationToken::new()).await
    }
}

impl ProcessorInner {
    async fn drain(&self, shutdown: &CancellationToken) {
        let types = self.registry.types();
        while !shutdown.is_cancelled() {
            match Task::claim_ready(self.listener.pool(), &types).await {
                Ok(Some(task_id)) => self.execute(task_id, shutdown).await,
                Ok(None) => {
                    debug!(processor_id = %self.processor_id, "No ready task");
                    break;
                }
                Err(e) => {
                    error!(processor_id = %self.processor_id, error = %e, "Failed to claim a task");
                    break;
                }
            }
        }
    }

    #[instrument(skip(self, shutdown), fields(processor_id = %self.processor_id))]
    async fn execute(&self, task_id: i64, shutdown: &CancellationToken) {
        let signal = shutdown.child_token();
        *self.current.lock() = Some(CurrentTask {
            task_id,
            signal: signal.clone(),
        });
        debug!("Acquired task");

        // An abort may have landed between the claim and registration
        if let Ok(Some(TaskStatus::Aborting)) = Task::find_status(self.listener.pool(), task_id).await {
            signal.cancel();
        }

        let outcome = self.run_handler(task_id, signal.clone()).await;
        *self.current.lock() = None;

        match outcome {
            Ok(_) if signal.is_cancelled() => {
                self.fail(task_id, &format!("Task {task_id} was aborted")).await
            }
            Ok(output) => match Task::complete(self.listener.pool(), task_id, &output).await {
                Ok(true) => log_task_operation("complete", task_id, None, TaskStatus::Success.as_str(), None),
                Ok(false) => {
                    self.fail(task_id, &format!("Task {task_id} was aborted while running")).await
                }
                Err(e) => {
                    self.fail(task_id, &format!("Failed to store output of task {task_id}: {e}")).await
                }
            },
            Err(e) => self.fail(task_id, &format!("{e:#}")).await,
        }
    }

    async fn run_handler(&self, task_id: i64, signal: CancellationToken) -> anyhow::Result<Value> {
        let task = self.listener.get_task(task_id).await?;
        let handler = self.registry.get(&task.task_type).ok_or_else(|| {
            SchedulerError::ConfigurationError(format!(
                "Invalid task type {} in task #{task_id}: matches no handler",
                task.task_type
            ))
        })?;

        let inputs = Task::find_outputs(self.listener.pool(), &task.after)
            .await
            .map_err(SchedulerError::from)?;
        if inputs.len() != task.after.len() {
            return Err(SchedulerError::DependencyError(format!(
                "Task #{task_id} expects {} inputs from {:?} but only {} resolved",
                task.after.len(),
                task.after,
                inputs.len()
            ))
            .into());
        }

        debug!(task_id = task_id, task_type = %task.task_type, "Processing task");
        let ctx = TaskHandlerContext::new(
            task,
            inputs,
            self.listener.clone(),
            signal,
            self.services.clone(),
        );

        // A panicking handler fails its task, not the processor
        match tokio::spawn(async move { handler.handle(ctx).await }).await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow::anyhow!("Handler panicked: {join_err}")),
        }
    }

    /// Log `message` against the task and mark it `error`. Never fails.
    async fn fail(&self, task_id: i64, message: &str) {
        warn!(processor_id = %self.processor_id, task_id = task_id, error = %message, "Task failed");
        if let Err(e) = self
            .listener
            .append_task_log(task_id, LogSeverity::Error, message)
            .await
        {
            error!(task_id = task_id, error = %e, "While trying to save task error log");
        }
        if let Err(e) = self.listener.set_status(task_id, TaskStatus::Error).await {
            error!(task_id = task_id, error = %e, "While trying to set task status");
        }
        log_task_operation("fail", task_id, None, TaskStatus::Error.as_str(), Some(message));
    }

    fn cancel_if_current(&self, task_id: i64) {
        if let Some(current) = self.current.lock().as_ref() {
            if current.task_id == task_id {
                info!(processor_id = %self.processor_id, task_id = task_id, "Aborting current task");
                current.signal.cancel();
            }
        }
    }
}

async fn run_event_loop(
    processor: Weak<ProcessorInner>,
    mut events: broadcast::Receiver<TaskEvent>,
    poll: SingleFlightTrigger,
    shutdown: CancellationToken,
) {
    loop {
        if processor.strong_count() == 0 {
            break;
        }
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(TaskEvent::Status {
                task_id,
                status: TaskStatus::Aborting,
            }) => match processor.upgrade() {
                Some(inner) => inner.cancel_if_current(task_id),
                None => break,
            },
            Ok(TaskEvent::Status {
                status: TaskStatus::Pending | TaskStatus::Success,
                ..
            })
            | Ok(TaskEvent::Resync) => {
                poll.trigger();
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped = skipped, "Processor lagged behind notifications");
                poll.trigger();
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
