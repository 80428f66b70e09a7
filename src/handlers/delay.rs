use super::sleep_or_cancel;
use crate::orchestration::TaskHandlerContext;
use crate::registry::TaskHandler;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayTaskParams {
    /// Delay in milliseconds
    pub time: u64,
    /// Upper bound (exclusive) of random extra milliseconds
    #[serde(default)]
    pub variance: Option<u64>,
    /// Output of the task
    #[serde(default)]
    pub value: Option<Value>,
}

impl DelayTaskParams {
    pub fn timeout(&self) -> Duration {
        let jitter = match self.variance {
            Some(variance) if variance > 0 => rand::thread_rng().gen_range(0..variance),
            _ => 0,
        };
        Duration::from_millis(self.time.saturating_add(jitter))
    }
}

/// Wait before resolving with `value`. A variance spreads out heavy loads.
pub struct DelayTask;

#[async_trait]
impl TaskHandler for DelayTask {
    async fn handle(&self, ctx: TaskHandlerContext) -> anyhow::Result<Value> {
        let params: DelayTaskParams = ctx.data()?;
        let timeout = params.timeout();
        ctx.logger
            .debug(format!("Start delay task with timeout: {}", timeout.as_millis()))
            .await;
        sleep_or_cancel(timeout, &ctx.signal, ctx.task_id()).await?;
        Ok(params.value.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timeout_without_variance_is_exact() {
        let params: DelayTaskParams = serde_json::from_value(json!({"time": 25})).unwrap();
        assert_eq!(params.timeout(), Duration::from_millis(25));
        assert_eq!(params.value, None);
    }

    #[test]
    fn test_variance_stays_in_bounds() {
        let params = DelayTaskParams {
            time: 10,
            variance: Some(5),
            value: None,
        };
        for _ in 0..100 {
            let timeout = params.timeout();
            assert!(timeout >= Duration::from_millis(10));
            assert!(timeout < Duration::from_millis(15));
        }
    }

    #[tokio::test]
    async fn test_cancelled_delay_returns_early() {
        let signal = tokio_util::sync::CancellationToken::new();
        signal.cancel();
        let result = sleep_or_cancel(Duration::from_secs(60), &signal, 3).await;
        assert!(matches!(result, Err(crate::error::SchedulerError::Cancelled(_))));
    }
}
