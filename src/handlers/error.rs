use super::sleep_or_cancel;
use crate::orchestration::TaskHandlerContext;
use crate::registry::TaskHandler;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorTaskParams {
    /// Milliseconds to wait before failing
    #[serde(default)]
    pub timeout: u64,
    pub message: String,
}

/// Always fails with the provided message. Mostly useful in tests.
pub struct ErrorTask;

#[async_trait]
impl TaskHandler for ErrorTask {
    async fn handle(&self, ctx: TaskHandlerContext) -> anyhow::Result<Value> {
        let params: ErrorTaskParams = ctx.data()?;
        sleep_or_cancel(Duration::from_millis(params.timeout), &ctx.signal, ctx.task_id()).await?;
        anyhow::bail!("{}", params.message)
    }
}
