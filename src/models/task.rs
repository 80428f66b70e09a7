//! # Task Model
//!
//! A task is one node of the processing DAG. Its dependencies (`after`) live
//! in `tasks_relations` rather than in an array column so the claim query can
//! test them with a cheap `NOT EXISTS`.
//!
//! ## Database Schema
//!
//! Maps to the `tasks` table:
//! - `task_id`: BIGSERIAL primary key, monotonic
//! - `owner_scope`: owning scene, opaque to the scheduler
//! - `user_id`: creator, nullable
//! - `type`: handler key
//! - `parent`: display hierarchy only, no effect on execution order
//! - `data` / `output`: JSONB handler input and result
//! - `status`: one of the [`TaskStatus`] values

use crate::state_machine::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;

/// A task with its dependency set resolved to plain ids (ascending).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: i64,
    pub owner_scope: i64,
    pub user_id: Option<i64>,
    pub ctime: DateTime<Utc>,
    #[serde(rename = "type")]
    pub task_type: String,
    pub parent: Option<i64>,
    pub after: Vec<i64>,
    pub data: Value,
    pub output: Option<Value>,
    pub status: TaskStatus,
}

/// Raw row as returned by the task queries
#[derive(Debug, FromRow)]
pub(crate) struct TaskRow {
    pub task_id: i64,
    pub owner_scope: i64,
    pub user_id: Option<i64>,
    pub ctime: DateTime<Utc>,
    pub task_type: String,
    pub parent: Option<i64>,
    pub after: Option<Vec<i64>>,
    pub data: Value,
    pub output: Option<Value>,
    pub status: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = sqlx::Error;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<TaskStatus>().map_err(|e| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: e.into(),
        })?;
        Ok(Task {
            task_id: row.task_id,
            owner_scope: row.owner_scope,
            user_id: row.user_id,
            ctime: row.ctime,
            task_type: row.task_type,
            parent: row.parent,
            after: row.after.unwrap_or_default(),
            data: row.data,
            output: row.output,
            status,
        })
    }
}

/// Parameters for creating a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTaskParams {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub parent: Option<i64>,
    #[serde(default)]
    pub after: Vec<i64>,
    #[serde(default)]
    pub status: TaskStatus,
}

impl CreateTaskParams {
    pub fn new(task_type: impl Into<String>, data: Value) -> Self {
        Self {
            task_type: task_type.into(),
            data,
            parent: None,
            after: Vec::new(),
            status: TaskStatus::Pending,
        }
    }

    pub fn with_parent(mut self, parent: i64) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_after(mut self, after: impl IntoIterator<Item = i64>) -> Self {
        self.after = after.into_iter().collect();
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }
}

const SELECT_TASK: &str = r#"
    SELECT
        task_id,
        owner_scope,
        user_id,
        ctime,
        type AS task_type,
        parent,
        (SELECT array_agg(source ORDER BY source) FROM tasks_relations WHERE target = task_id) AS after,
        data,
        output,
        status
    FROM tasks
"#;

impl Task {
    /// Insert a task and its dependency edges in one transaction.
    pub async fn create(
        pool: &PgPool,
        owner_scope: i64,
        user_id: Option<i64>,
        params: &CreateTaskParams,
    ) -> Result<i64, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let (task_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO tasks (owner_scope, user_id, parent, type, data, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING task_id
            "#,
        )
        .bind(owner_scope)
        .bind(user_id)
        .bind(params.parent)
        .bind(&params.task_type)
        .bind(&params.data)
        .bind(params.status.as_str())
        .fetch_one(&mut *tx)
        .await?;

        Self::insert_edges(&mut tx, task_id, &params.after).await?;
        tx.commit().await?;
        Ok(task_id)
    }

    /// Insert a task under `parent_id`, inheriting its owner scope and creator.
    ///
    /// Returns `None` when the parent does not exist.
    pub async fn create_child(
        pool: &PgPool,
        parent_id: i64,
        params: &CreateTaskParams,
    ) -> Result<Option<i64>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO tasks (owner_scope, user_id, parent, type, data, status)
            SELECT owner_scope, user_id, task_id, $2, $3, $4
            FROM tasks
            WHERE task_id = $1
            RETURNING task_id
            "#,
        )
        .bind(parent_id)
        .bind(&params.task_type)
        .bind(&params.data)
        .bind(params.status.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((task_id,)) = inserted else {
            tx.rollback().await?;
            return Ok(None);
        };

        Self::insert_edges(&mut tx, task_id, &params.after).await?;
        tx.commit().await?;
        Ok(Some(task_id))
    }

    async fn insert_edges(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        target: i64,
        after: &[i64],
    ) -> Result<(), sqlx::Error> {
        if after.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO tasks_relations (source, target)
            SELECT DISTINCT source, $2 FROM unnest($1::bigint[]) AS source
            "#,
        )
        .bind(after)
        .bind(target)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Task>, sqlx::Error> {
        let row = sqlx::query_as::<_, TaskRow>(&format!("{SELECT_TASK} WHERE task_id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    /// Current status only, without resolving relations
    pub async fn find_status(pool: &PgPool, id: i64) -> Result<Option<TaskStatus>, sqlx::Error> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM tasks WHERE task_id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        row.map(|(status,)| {
            status.parse::<TaskStatus>().map_err(|e| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: e.into(),
            })
        })
        .transpose()
    }

    /// Overwrite a task's status. Returns whether a row was updated.
    pub async fn set_status(
        pool: &PgPool,
        id: i64,
        status: TaskStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE tasks SET status = $2 WHERE task_id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically claim one ready task whose type is in `task_types`.
    ///
    /// A task is ready when it is `pending` and none of its dependencies has
    /// a status other than `success`. `SKIP LOCKED` guarantees two concurrent
    /// claimers never select the same row.
    pub async fn claim_ready(
        pool: &PgPool,
        task_types: &[String],
    ) -> Result<Option<i64>, sqlx::Error> {
        let claimed: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE tasks
            SET status = 'running'
            WHERE task_id = (
                SELECT candidate.task_id
                FROM tasks AS candidate
                WHERE candidate.status = 'pending'
                  AND candidate.type = ANY($1::text[])
                  AND NOT EXISTS (
                      SELECT 1
                      FROM tasks_relations
                          INNER JOIN tasks AS source_tasks ON source = source_tasks.task_id
                      WHERE target = candidate.task_id
                        AND source_tasks.status <> 'success'
                  )
                LIMIT 1
                FOR UPDATE OF candidate SKIP LOCKED
            )
            RETURNING task_id
            "#,
        )
        .bind(task_types)
        .fetch_optional(pool)
        .await?;
        Ok(claimed.map(|(id,)| id))
    }

    /// Store the output and mark the task `success`.
    ///
    /// Only applies to a task still `running`: a task moved to `aborting`
    /// while its handler ran is left for the caller to fail.
    pub async fn complete(pool: &PgPool, id: i64, output: &Value) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'success', output = $2 WHERE task_id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(output)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Outputs of the successful tasks among `ids`, keyed by task id.
    pub async fn find_outputs(
        pool: &PgPool,
        ids: &[i64],
    ) -> Result<BTreeMap<i64, Value>, sqlx::Error> {
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let rows: Vec<(i64, Option<Value>)> = sqlx::query_as(
            "SELECT task_id, output FROM tasks WHERE task_id = ANY($1::bigint[]) AND status = 'success'",
        )
        .bind(ids)
        .fetch_all(pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, output)| (id, output.unwrap_or(Value::Null)))
            .collect())
    }

    /// Request cancellation.
    ///
    /// A `running` task moves to `aborting`; a task not yet claimed
    /// (`pending` or `initializing`) moves straight to `error`, with
    /// `reason` logged in the same transaction so waiters see it. Returns the
    /// new status, or `None` if the task is missing or already settled.
    pub async fn abort(pool: &PgPool, id: i64, reason: &str) -> Result<Option<TaskStatus>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE tasks
            SET status = CASE WHEN status = 'running' THEN 'aborting' ELSE 'error' END
            WHERE task_id = $1 AND status IN ('running', 'pending', 'initializing')
            RETURNING status
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let status = row
            .map(|(status,)| {
                status.parse::<TaskStatus>().map_err(|e| sqlx::Error::ColumnDecode {
                    index: "status".to_string(),
                    source: e.into(),
                })
            })
            .transpose()?;

        if status == Some(TaskStatus::Error) {
            sqlx::query("INSERT INTO tasks_logs (fk_task_id, severity, message) VALUES ($1, 'error', $2)")
                .bind(id)
                .bind(reason)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(status)
    }

    /// Delete a task. Edges and child tasks cascade.
    pub async fn delete(pool: &PgPool, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM tasks WHERE task_id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// In-process event produced by the task listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task entered `status`, as announced on the matching channel
    Status { task_id: i64, status: TaskStatus },
    /// The notification stream was interrupted and events may have been
    /// missed; subscribers re-read the state they care about
    Resync,
    /// Listener-side failure that was swallowed, e.g. while resolving a
    /// task's error message
    ListenerError { message: String },
}

impl TaskEvent {
    pub fn status(task_id: i64, status: TaskStatus) -> Self {
        Self::Status { task_id, status }
    }

    /// Whether this event announces `task_id` reaching a status
    pub fn concerns(&self, task_id: i64) -> bool {
        matches!(self, Self::Status { task_id: id, .. } if *id == task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_params_builder() {
        let params = CreateTaskParams::new("delayTask", json!({"time": 0}))
            .with_parent(3)
            .with_after([1, 2]);
        assert_eq!(params.task_type, "delayTask");
        assert_eq!(params.parent, Some(3));
        assert_eq!(params.after, vec![1, 2]);
        assert_eq!(params.status, TaskStatus::Pending);
    }

    #[test]
    fn test_create_params_deserialize_with_defaults() {
        let params: CreateTaskParams =
            serde_json::from_value(json!({"type": "delayTask", "data": {"time": 5}})).unwrap();
        assert_eq!(params.task_type, "delayTask");
        assert!(params.after.is_empty());
        assert_eq!(params.parent, None);
        assert_eq!(params.status, TaskStatus::Pending);
    }

    #[test]
    fn test_row_conversion_rejects_unknown_status() {
        let row = TaskRow {
            task_id: 1,
            owner_scope: 1,
            user_id: None,
            ctime: Utc::now(),
            task_type: "delayTask".to_string(),
            parent: None,
            after: None,
            data: json!({}),
            output: None,
            status: "complete".to_string(),
        };
        assert!(Task::try_from(row).is_err());
    }

    #[test]
    fn test_event_concerns_only_status_of_same_task() {
        let event = TaskEvent::status(4, TaskStatus::Success);
        assert!(event.concerns(4));
        assert!(!event.concerns(5));
        assert!(!TaskEvent::Resync.concerns(4));
    }
}
