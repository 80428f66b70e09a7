//! # Task Relation
//!
//! Dependency edges of the task DAG. An edge `source -> target` means
//! `target` may only be claimed once `source` reached `success`. The store
//! rejects edges that would close a cycle (`check_no_cycles`).

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct TaskRelation {
    pub source: i64,
    pub target: i64,
}

impl TaskRelation {
    pub async fn create(pool: &PgPool, source: i64, target: i64) -> Result<TaskRelation, sqlx::Error> {
        sqlx::query_as::<_, TaskRelation>(
            r#"
            INSERT INTO tasks_relations (source, target)
            VALUES ($1, $2)
            RETURNING source, target
            "#,
        )
        .bind(source)
        .bind(target)
        .fetch_one(pool)
        .await
    }

    /// Edges touching `task_id` on either side
    pub async fn count_touching(pool: &PgPool, task_id: i64) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks_relations WHERE source = $1 OR target = $1",
        )
        .bind(task_id)
        .fetch_one(pool)
        .await?;
        Ok(count)
    }
}
