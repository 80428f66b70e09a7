//! `forEachTask`: create every listed child at once and wait for all of
//! them. Children run on other processors, so a worker pool running this
//! type needs at least two processors.

use super::reduce::ReduceChild;
use crate::error::SchedulerError;
use crate::models::CreateTaskParams;
use crate::orchestration::TaskHandlerContext;
use crate::registry::TaskHandler;
use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForEachTaskParams {
    #[serde(default)]
    pub children: Vec<ReduceChild>,
}

pub struct ForEachTask;

#[async_trait]
impl TaskHandler for ForEachTask {
    async fn handle(&self, ctx: TaskHandlerContext) -> anyhow::Result<Value> {
        let params: ForEachTaskParams = ctx.data()?;

        let mut ids = Vec::with_capacity(params.children.len());
        for child in params.children {
            ids.push(ctx.tasks.create(CreateTaskParams::new(child.task_type, child.data)).await?);
        }
        ctx.logger.debug(format!("Waiting on child tasks: {ids:?}")).await;

        let waits = try_join_all(ids.iter().map(|id| ctx.tasks.wait(*id)));
        tokio::select! {
            _ = ctx.signal.cancelled() => {
                Err(anyhow::Error::from(SchedulerError::Cancelled(format!(
                    "Task {} was aborted",
                    ctx.task_id()
                ))))
            }
            outputs = waits => {
                outputs?;
                Ok(Value::Null)
            }
        }
    }
}
