//! Sequential fan-out: `reduceTasks` creates each child after itself, then an
//! `afterReduceTasks` task depending on all of them, and outputs the latter's
//! id. Waiting on the reduce task therefore follows the chain and resolves
//! with the children's outputs in the listed order.

use crate::constants::task_types;
use crate::models::CreateTaskParams;
use crate::orchestration::TaskHandlerContext;
use crate::registry::TaskHandler;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceChild {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReduceTasksParams {
    #[serde(default)]
    pub tasks: Option<Vec<ReduceChild>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AfterReduceTasksParams {
    #[serde(default)]
    pub tasks: Option<Vec<i64>>,
}

pub struct ReduceTasks;

#[async_trait]
impl TaskHandler for ReduceTasks {
    async fn handle(&self, ctx: TaskHandlerContext) -> anyhow::Result<Value> {
        let params: ReduceTasksParams = ctx.data()?;
        let Some(children) = params.tasks else {
            return Ok(json!([]));
        };

        let mut ids = Vec::with_capacity(children.len());
        for child in children {
            let id = ctx
                .tasks
                .create(CreateTaskParams::new(child.task_type, child.data).with_after([ctx.task_id()]))
                .await?;
            ids.push(id);
        }
        ctx.logger.debug(format!("Created child tasks: {ids:?}")).await;

        let reducer = ctx
            .tasks
            .create(
                CreateTaskParams::new(task_types::AFTER_REDUCE, json!({ "tasks": ids.clone() }))
                    .with_after(ids),
            )
            .await?;
        Ok(json!(reducer))
    }
}

pub struct AfterReduceTasks;

#[async_trait]
impl TaskHandler for AfterReduceTasks {
    async fn handle(&self, ctx: TaskHandlerContext) -> anyhow::Result<Value> {
        let params: AfterReduceTasksParams = ctx.data()?;
        let Some(children) = params.tasks else {
            return Ok(json!([]));
        };

        ctx.logger.debug(format!("Reducing #{}", ctx.task_id())).await;
        // One child at a time, in the listed order
        let mut outputs = Vec::with_capacity(children.len());
        for child in children {
            let result = ctx.tasks.wait(child).await?;
            ctx.logger
                .debug(format!("Successfully reduced task {child}: {result}"))
                .await;
            outputs.push(result);
        }
        Ok(Value::Array(outputs))
    }
}
