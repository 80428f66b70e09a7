//! # Task Trees
//!
//! Hierarchical (`parent`) views over tasks for the administrative API. Each
//! node carries its derived group status: the most pessimistic status found
//! in the node and all of its descendants.

use crate::state_machine::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTreeNode {
    pub task_id: i64,
    pub owner_scope: i64,
    pub user_id: Option<i64>,
    pub ctime: DateTime<Utc>,
    #[serde(rename = "type")]
    pub task_type: String,
    pub parent: Option<i64>,
    pub after: Vec<i64>,
    pub status: TaskStatus,
    pub group_status: TaskStatus,
    pub children: Vec<TaskTreeNode>,
}

impl TaskTreeNode {
    /// Depth-first search for `task_id` in this subtree
    pub fn find(&self, task_id: i64) -> Option<&TaskTreeNode> {
        if self.task_id == task_id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(task_id))
    }

    /// Number of nodes in this subtree, including itself
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(TaskTreeNode::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Flat tree row, before linking children to parents
#[derive(Debug, Clone, FromRow)]
pub(crate) struct TreeRow {
    pub task_id: i64,
    pub owner_scope: i64,
    pub user_id: Option<i64>,
    pub ctime: DateTime<Utc>,
    pub task_type: String,
    pub parent: Option<i64>,
    pub after: Option<Vec<i64>>,
    pub status: String,
}

/// Filters for listing root tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskListQuery {
    pub owner_scope: Option<i64>,
    pub user_id: Option<i64>,
    /// Status of the root task itself
    pub status: Option<TaskStatus>,
    /// Only roots created at or after this instant
    pub created_after: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for TaskListQuery {
    fn default() -> Self {
        Self {
            owner_scope: None,
            user_id: None,
            status: None,
            created_after: None,
            limit: crate::constants::system::DEFAULT_TASK_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl TaskListQuery {
    pub fn for_scope(owner_scope: i64) -> Self {
        Self {
            owner_scope: Some(owner_scope),
            ..Self::default()
        }
    }

    pub fn for_user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    /// 1-indexed page of `per_page` roots
    pub fn page(mut self, page: i64, per_page: i64) -> Self {
        self.limit = per_page.max(1);
        self.offset = (page.max(1) - 1).saturating_mul(self.limit);
        self
    }
}

const TREE_COLUMNS: &str = r#"
    task_id,
    owner_scope,
    user_id,
    ctime,
    type AS task_type,
    parent,
    (SELECT array_agg(source ORDER BY source) FROM tasks_relations WHERE target = task_id) AS after,
    status
"#;

/// Link flat rows into trees rooted at `root_ids`, in the order given.
pub(crate) fn build_trees(rows: Vec<TreeRow>, root_ids: &[i64]) -> Result<Vec<TaskTreeNode>, String> {
    let mut by_id: HashMap<i64, TreeRow> = HashMap::with_capacity(rows.len());
    let mut children_of: HashMap<i64, Vec<i64>> = HashMap::new();
    for row in rows {
        if let Some(parent) = row.parent {
            children_of.entry(parent).or_default().push(row.task_id);
        }
        by_id.insert(row.task_id, row);
    }
    for ids in children_of.values_mut() {
        ids.sort_unstable();
    }

    root_ids
        .iter()
        .filter(|id| by_id.contains_key(id))
        .map(|id| build_node(*id, &by_id, &children_of))
        .collect()
}

fn build_node(
    task_id: i64,
    by_id: &HashMap<i64, TreeRow>,
    children_of: &HashMap<i64, Vec<i64>>,
) -> Result<TaskTreeNode, String> {
    let row = by_id
        .get(&task_id)
        .ok_or_else(|| format!("task {task_id} missing from tree rows"))?;
    let status = row.status.parse::<TaskStatus>()?;

    let children = children_of
        .get(&task_id)
        .map(|ids| {
            ids.iter()
                .filter(|id| by_id.contains_key(id))
                .map(|id| build_node(*id, by_id, children_of))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    let group_status = TaskStatus::most_pessimistic(
        std::iter::once(status).chain(children.iter().map(|child| child.group_status)),
    )
    .unwrap_or(status);

    Ok(TaskTreeNode {
        task_id,
        owner_scope: row.owner_scope,
        user_id: row.user_id,
        ctime: row.ctime,
        task_type: row.task_type.clone(),
        parent: row.parent,
        after: row.after.clone().unwrap_or_default(),
        status,
        group_status,
        children,
    })
}

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: "status".to_string(),
        source: message.into(),
    }
}

impl TaskTreeNode {
    /// Subtree rooted at `task_id`
    pub async fn find_subtree(pool: &PgPool, task_id: i64) -> Result<Option<TaskTreeNode>, sqlx::Error> {
        let rows = sqlx::query_as::<_, TreeRow>(&format!(
            r#"
            WITH RECURSIVE subtree AS (
                SELECT task_id FROM tasks WHERE task_id = $1
                UNION
                SELECT tasks.task_id FROM tasks INNER JOIN subtree ON tasks.parent = subtree.task_id
            )
            SELECT {TREE_COLUMNS}
            FROM tasks
            WHERE task_id IN (SELECT task_id FROM subtree)
            "#
        ))
        .bind(task_id)
        .fetch_all(pool)
        .await?;

        let mut trees = build_trees(rows, &[task_id]).map_err(decode_error)?;
        Ok(trees.pop())
    }

    /// Id of the root reached by walking `parent` links up from `task_id`
    pub async fn find_root_id(pool: &PgPool, task_id: i64) -> Result<Option<i64>, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            WITH RECURSIVE ancestors AS (
                SELECT task_id, parent FROM tasks WHERE task_id = $1
                UNION
                SELECT tasks.task_id, tasks.parent
                FROM tasks INNER JOIN ancestors ON tasks.task_id = ancestors.parent
            )
            SELECT task_id FROM ancestors WHERE parent IS NULL
            "#,
        )
        .bind(task_id)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    /// One page of root tasks (newest first) with their full descendant trees
    pub async fn list_roots(pool: &PgPool, query: &TaskListQuery) -> Result<Vec<TaskTreeNode>, sqlx::Error> {
        let roots: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT task_id
            FROM tasks
            WHERE parent IS NULL
              AND ($1::bigint IS NULL OR owner_scope = $1)
              AND ($2::bigint IS NULL OR user_id = $2)
              AND ($3::text IS NULL OR status = $3)
              AND ($4::timestamptz IS NULL OR ctime >= $4)
            ORDER BY ctime DESC, task_id DESC
            LIMIT $5
            OFFSET $6
            "#,
        )
        .bind(query.owner_scope)
        .bind(query.user_id)
        .bind(query.status.map(|s| s.as_str()))
        .bind(query.created_after)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(pool)
        .await?;

        let root_ids: Vec<i64> = roots.into_iter().map(|(id,)| id).collect();
        if root_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, TreeRow>(&format!(
            r#"
            WITH RECURSIVE tree AS (
                SELECT task_id FROM tasks WHERE task_id = ANY($1::bigint[])
                UNION
                SELECT tasks.task_id FROM tasks INNER JOIN tree ON tasks.parent = tree.task_id
            )
            SELECT {TREE_COLUMNS}
            FROM tasks
            WHERE task_id IN (SELECT task_id FROM tree)
            "#
        ))
        .bind(&root_ids)
        .fetch_all(pool)
        .await?;

        build_trees(rows, &root_ids).map_err(decode_error)
    }
}

/// Render a tree as indented text lines
pub fn format_task_tree(node: &TaskTreeNode) -> Vec<String> {
    let mut lines = vec![format!("├─ #{} {} ({})", node.task_id, node.task_type, node.status)];
    for child in &node.children {
        lines.extend(format_task_tree(child).into_iter().map(|line| format!("│  {line}")));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(task_id: i64, parent: Option<i64>, task_type: &str, status: &str) -> TreeRow {
        TreeRow {
            task_id,
            owner_scope: 1,
            user_id: None,
            ctime: Utc::now(),
            task_type: task_type.to_string(),
            parent,
            after: None,
            status: status.to_string(),
        }
    }

    #[test]
    fn test_build_tree_links_children_in_id_order() {
        let rows = vec![
            row(3, Some(1), "delayTask", "success"),
            row(1, None, "extractZip", "pending"),
            row(2, Some(1), "delayTask", "success"),
            row(4, Some(3), "delayTask", "success"),
        ];
        let trees = build_trees(rows, &[1]).unwrap();
        assert_eq!(trees.len(), 1);
        let root = &trees[0];
        assert_eq!(root.children.iter().map(|c| c.task_id).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(root.children[1].children[0].task_id, 4);
        assert_eq!(root.len(), 4);
        assert_eq!(root.find(4).map(|n| n.task_id), Some(4));
        assert!(root.find(9).is_none());
    }

    #[test]
    fn test_group_status_is_most_pessimistic_descendant() {
        let rows = vec![
            row(1, None, "handleUploads", "success"),
            row(2, Some(1), "delayTask", "success"),
            row(3, Some(1), "delayTask", "pending"),
            row(4, Some(3), "errorTask", "error"),
        ];
        let root = build_trees(rows, &[1]).unwrap().remove(0);
        assert_eq!(root.status, TaskStatus::Success);
        assert_eq!(root.group_status, TaskStatus::Error);
        assert_eq!(root.children[0].group_status, TaskStatus::Success);
        assert_eq!(root.children[1].group_status, TaskStatus::Error);
    }

    #[test]
    fn test_pending_work_keeps_group_open() {
        let rows = vec![
            row(1, None, "groupOutputsTask", "success"),
            row(2, Some(1), "delayTask", "pending"),
        ];
        let root = build_trees(rows, &[1]).unwrap().remove(0);
        assert_eq!(root.group_status, TaskStatus::Pending);
    }

    #[test]
    fn test_roots_keep_requested_order() {
        let rows = vec![row(1, None, "a", "success"), row(2, None, "b", "success")];
        let trees = build_trees(rows, &[2, 1]).unwrap();
        assert_eq!(trees.iter().map(|t| t.task_id).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn test_format_simple_task() {
        let root = build_trees(vec![row(0, None, "extractZip", "pending")], &[0])
            .unwrap()
            .remove(0);
        assert_eq!(format_task_tree(&root), vec!["├─ #0 extractZip (pending)"]);
    }

    #[test]
    fn test_format_children() {
        let rows = vec![
            row(0, None, "extractZip", "pending"),
            row(1, Some(0), "delayTask", "success"),
            row(2, Some(0), "delayTask", "success"),
            row(3, Some(2), "delayTask", "error"),
        ];
        let root = build_trees(rows, &[0]).unwrap().remove(0);
        assert_eq!(
            format_task_tree(&root),
            vec![
                "├─ #0 extractZip (pending)",
                "│  ├─ #1 delayTask (success)",
                "│  ├─ #2 delayTask (success)",
                "│  │  ├─ #3 delayTask (error)",
            ]
        );
    }

    #[test]
    fn test_list_query_paging() {
        let query = TaskListQuery::for_scope(7).page(3, 10);
        assert_eq!(query.owner_scope, Some(7));
        assert_eq!(query.limit, 10);
        assert_eq!(query.offset, 20);

        let first = TaskListQuery::for_scope(7).page(0, 0);
        assert_eq!((first.limit, first.offset), (1, 0));
    }

    #[test]
    fn test_list_query_paging_saturates() {
        let query = TaskListQuery::default().page(i64::MAX, 1000);
        assert_eq!(query.limit, 1000);
        assert_eq!(query.offset, i64::MAX);
    }
}
