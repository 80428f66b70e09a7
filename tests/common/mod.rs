//! # Integration Test Helpers
//!
//! A small in-process cluster: one scheduler and N processors sharing the
//! per-test database handed out by `#[sqlx::test]`. Every listener holds a
//! pool connection, so tests must call [`Cluster::shutdown`] before
//! returning or the pool cannot close.

#![expect(
    dead_code,
    reason = "Each integration test crate uses a different subset of the helpers"
)]

use scene_tasks::error::Result;
use scene_tasks::models::CreateTaskParams;
use scene_tasks::orchestration::{TaskListener, TaskProcessor, TaskScheduler};
use scene_tasks::registry::HandlerRegistry;
use scene_tasks::state_machine::TaskStatus;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::{Arc, Once};
use std::time::Duration;

pub const OWNER: i64 = 1;
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness. `RUST_LOG` controls verbosity.
pub fn init_test_logging() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn delay(time: u64, value: Value) -> CreateTaskParams {
    CreateTaskParams::new("delayTask", json!({ "time": time, "value": value }))
}

pub fn fail_with(message: &str) -> CreateTaskParams {
    CreateTaskParams::new("errorTask", json!({ "message": message }))
}

pub struct Cluster {
    pub scheduler: TaskScheduler,
    pub processors: Vec<TaskProcessor>,
}

impl Cluster {
    pub async fn start(pool: &PgPool, workers: usize) -> Self {
        Self::with_registry(pool, workers, HandlerRegistry::with_control_handlers()).await
    }

    pub async fn with_registry(pool: &PgPool, workers: usize, registry: HandlerRegistry) -> Self {
        init_test_logging();
        let registry = Arc::new(registry);
        let mut processors = Vec::with_capacity(workers);
        for _ in 0..workers {
            let processor = TaskProcessor::new(TaskListener::new(pool.clone()), registry.clone());
            processor.start().await.expect("processor should start");
            processors.push(processor);
        }

        let scheduler = TaskScheduler::new(pool.clone());
        scheduler.start().await.expect("scheduler should start");
        Self {
            scheduler,
            processors,
        }
    }

    /// `wait` bounded by [`WAIT_TIMEOUT`]
    pub async fn wait(&self, task_id: i64) -> Result<Value> {
        tokio::time::timeout(WAIT_TIMEOUT, self.scheduler.wait(task_id))
            .await
            .unwrap_or_else(|_| panic!("task {task_id} did not settle in time"))
    }

    /// Poll until `task_id` reaches `status`
    pub async fn wait_for_status(&self, task_id: i64, status: TaskStatus) {
        let poll = async {
            loop {
                let task = self.scheduler.get_task(task_id).await.expect("task exists");
                if task.status == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(WAIT_TIMEOUT, poll)
            .await
            .unwrap_or_else(|_| panic!("task {task_id} never reached {status}"));
    }

    pub async fn shutdown(self) {
        for processor in &self.processors {
            processor.stop().await;
        }
        self.scheduler.stop().await;
    }
}
