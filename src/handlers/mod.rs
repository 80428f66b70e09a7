//! # Control Handlers
//!
//! Built-in task types used to shape pipelines: delays, forced failures,
//! groups, fan-outs and reductions. Register them with
//! [`HandlerRegistry::with_control_handlers`](crate::registry::HandlerRegistry::with_control_handlers).

pub mod delay;
pub mod error;
pub mod for_each;
pub mod group;
pub mod group_outputs;
pub mod reduce;

pub use delay::{DelayTask, DelayTaskParams};
pub use error::{ErrorTask, ErrorTaskParams};
pub use for_each::{ForEachTask, ForEachTaskParams};
pub use group::GroupTask;
pub use group_outputs::{map_shape, GroupOutputsTask, ShapeError};
pub use reduce::{AfterReduceTasks, ReduceTasks};

use crate::error::SchedulerError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep for `duration` unless `signal` fires first
pub(crate) async fn sleep_or_cancel(
    duration: Duration,
    signal: &CancellationToken,
    task_id: i64,
) -> Result<(), SchedulerError> {
    tokio::select! {
        _ = signal.cancelled() => Err(SchedulerError::Cancelled(format!("Task {task_id} was aborted"))),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
