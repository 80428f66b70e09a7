//! # Task Log
//!
//! Lines written by handlers through their context logger, kept for the
//! administrative views and for building `wait()` rejections.

use crate::state_machine::LogSeverity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLog {
    pub log_id: i64,
    pub task_id: i64,
    pub timestamp: DateTime<Utc>,
    pub severity: LogSeverity,
    pub message: String,
}

#[derive(Debug, FromRow)]
struct TaskLogRow {
    log_id: i64,
    fk_task_id: i64,
    timestamp: DateTime<Utc>,
    severity: String,
    message: String,
}

impl TryFrom<TaskLogRow> for TaskLog {
    type Error = sqlx::Error;

    fn try_from(row: TaskLogRow) -> Result<Self, Self::Error> {
        let severity = row
            .severity
            .parse::<LogSeverity>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "severity".to_string(),
                source: e.into(),
            })?;
        Ok(TaskLog {
            log_id: row.log_id,
            task_id: row.fk_task_id,
            timestamp: row.timestamp,
            severity,
            message: row.message,
        })
    }
}

impl TaskLog {
    pub async fn append(
        pool: &PgPool,
        task_id: i64,
        severity: LogSeverity,
        message: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO tasks_logs (fk_task_id, severity, message) VALUES ($1, $2, $3)")
            .bind(task_id)
            .bind(severity.as_str())
            .bind(message)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// One page of a task's log, oldest first
    pub async fn list_for_task(
        pool: &PgPool,
        task_id: i64,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TaskLog>, sqlx::Error> {
        sqlx::query_as::<_, TaskLogRow>(
            r#"
            SELECT log_id, fk_task_id, timestamp, severity, message
            FROM tasks_logs
            WHERE fk_task_id = $1
            ORDER BY log_id
            OFFSET $2
            LIMIT $3
            "#,
        )
        .bind(task_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(TaskLog::try_from)
        .collect()
    }

    /// Message of the most recent `error` line
    pub async fn last_error(pool: &PgPool, task_id: i64) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT message
            FROM tasks_logs
            WHERE fk_task_id = $1 AND severity = 'error'
            ORDER BY log_id DESC
            LIMIT 1
            "#,
        )
        .bind(task_id)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(|(message,)| message))
    }
}
