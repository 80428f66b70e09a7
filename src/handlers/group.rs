use crate::orchestration::TaskHandlerContext;
use crate::registry::TaskHandler;
use async_trait::async_trait;
use serde_json::Value;

/// Empty task serving as a receptacle for child tasks
pub struct GroupTask;

#[async_trait]
impl TaskHandler for GroupTask {
    async fn handle(&self, _ctx: TaskHandlerContext) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }
}
