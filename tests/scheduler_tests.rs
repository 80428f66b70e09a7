//! Control plane: listings, trees, logs, deletion and abort

mod common;

use common::{delay, init_test_logging, Cluster, OWNER};
use scene_tasks::error::SchedulerError;
use scene_tasks::models::{format_task_tree, CreateTaskParams, TaskListQuery, TaskRelation};
use scene_tasks::orchestration::scheduler::ABORTED_BEFORE_START;
use scene_tasks::orchestration::TaskScheduler;
use scene_tasks::state_machine::{LogSeverity, TaskStatus};
use serde_json::json;
use sqlx::PgPool;

#[sqlx::test(migrator = "scene_tasks::database::migrator::MIGRATOR")]
async fn test_get_tasks_filters_and_pages_roots(pool: PgPool) {
    let scheduler = TaskScheduler::new(pool);

    let mut roots = Vec::new();
    for i in 0..5 {
        let user = if i % 2 == 0 { Some(10) } else { Some(20) };
        roots.push(scheduler.create(OWNER, user, delay(0, json!(format!("scene {i}")))).await.unwrap());
    }
    let other_scope = scheduler.create(2, Some(10), delay(0, json!(null))).await.unwrap();
    let child = scheduler.create_child(roots[0], delay(0, json!(null))).await.unwrap();

    let all = scheduler.get_tasks(&TaskListQuery::for_scope(OWNER)).await.unwrap();
    let ids: Vec<i64> = all.iter().map(|t| t.task_id).collect();
    let newest_first: Vec<i64> = roots.iter().rev().copied().collect();
    assert_eq!(ids, newest_first);
    assert!(!ids.contains(&other_scope));
    assert!(!ids.contains(&child), "children are nested, never listed as roots");

    let oldest = all.last().unwrap();
    assert_eq!(oldest.children.len(), 1);
    assert_eq!(oldest.children[0].task_id, child);

    let user_tasks = scheduler.get_tasks(&TaskListQuery::for_user(10)).await.unwrap();
    let ids: Vec<i64> = user_tasks.iter().map(|t| t.task_id).collect();
    assert_eq!(ids, vec![other_scope, roots[4], roots[2], roots[0]]);

    let second_page = scheduler
        .get_tasks(&TaskListQuery::for_scope(OWNER).page(2, 2))
        .await
        .unwrap();
    let ids: Vec<i64> = second_page.iter().map(|t| t.task_id).collect();
    assert_eq!(ids, vec![roots[2], roots[1]]);

    let mut bad = TaskListQuery::for_scope(OWNER);
    bad.limit = 0;
    assert!(matches!(
        scheduler.get_tasks(&bad).await,
        Err(SchedulerError::ValidationError(_))
    ));
}

#[sqlx::test(migrator = "scene_tasks::database::migrator::MIGRATOR")]
async fn test_get_tasks_filters_by_root_status(pool: PgPool) {
    let scheduler = TaskScheduler::new(pool);

    let pending = scheduler.create(OWNER, None, delay(0, json!(null))).await.unwrap();
    let aborted = scheduler.create(OWNER, None, delay(0, json!(null))).await.unwrap();
    scheduler.abort(aborted).await.unwrap();

    for (status, expected) in [(TaskStatus::Error, aborted), (TaskStatus::Pending, pending)] {
        let query = TaskListQuery {
            status: Some(status),
            ..TaskListQuery::for_scope(OWNER)
        };
        let ids: Vec<i64> = scheduler
            .get_tasks(&query)
            .await
            .unwrap()
            .iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(ids, vec![expected]);
    }
}

#[sqlx::test(migrator = "scene_tasks::database::migrator::MIGRATOR")]
async fn test_trees_and_group_status(pool: PgPool) {
    let scheduler = TaskScheduler::new(pool);

    let root = scheduler.create(OWNER, None, delay(0, json!(null))).await.unwrap();
    let left = scheduler.create_child(root, delay(0, json!(null))).await.unwrap();
    let right = scheduler.create_child(root, delay(0, json!(null))).await.unwrap();
    let leaf = scheduler.create_child(left, delay(0, json!(null))).await.unwrap();

    scheduler.listener().set_status(root, TaskStatus::Success).await.unwrap();
    scheduler.listener().set_status(right, TaskStatus::Success).await.unwrap();
    scheduler.listener().set_status(leaf, TaskStatus::Running).await.unwrap();

    let tree = scheduler.get_task_tree(root).await.unwrap();
    assert_eq!(tree.len(), 4);
    let child_ids: Vec<i64> = tree.children.iter().map(|c| c.task_id).collect();
    assert_eq!(child_ids, vec![left, right]);
    assert_eq!(tree.status, TaskStatus::Success);
    assert_eq!(tree.group_status, TaskStatus::Running);
    assert_eq!(tree.find(right).unwrap().group_status, TaskStatus::Success);
    assert_eq!(tree.find(left).unwrap().group_status, TaskStatus::Running);

    let from_leaf = scheduler.get_root_tree(leaf).await.unwrap();
    assert_eq!(from_leaf.task_id, root);
    assert_eq!(from_leaf.len(), 4);

    let subtree = scheduler.get_task_tree(left).await.unwrap();
    assert_eq!(subtree.len(), 2);

    let lines = format_task_tree(&tree);
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], format!("├─ #{root} delayTask (success)"));
    assert_eq!(lines[2], format!("│  │  ├─ #{leaf} delayTask (running)"));

    scheduler.listener().set_status(leaf, TaskStatus::Error).await.unwrap();
    let tree = scheduler.get_task_tree(root).await.unwrap();
    assert_eq!(tree.group_status, TaskStatus::Error);

    assert!(scheduler.get_task_tree(999).await.unwrap_err().is_not_found());
    assert!(scheduler.get_root_tree(999).await.unwrap_err().is_not_found());
}

#[sqlx::test(migrator = "scene_tasks::database::migrator::MIGRATOR")]
async fn test_task_logs_are_paged(pool: PgPool) {
    let scheduler = TaskScheduler::new(pool);
    let id = scheduler.create(OWNER, None, delay(0, json!(null))).await.unwrap();
    for i in 0..30 {
        scheduler
            .listener()
            .append_task_log(id, LogSeverity::Log, &format!("line {i}"))
            .await
            .unwrap();
    }

    let first = scheduler.get_task_logs(id, 0, None).await.unwrap();
    assert_eq!(first.len(), 25);
    assert_eq!(first[0].message, "line 0");

    let rest = scheduler.get_task_logs(id, 25, Some(10)).await.unwrap();
    let messages: Vec<&str> = rest.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages, ["line 25", "line 26", "line 27", "line 28", "line 29"]);

    let single = scheduler.get_task_logs(id, 3, Some(0)).await.unwrap();
    assert_eq!(single.len(), 1);
    assert_eq!(single[0].message, "line 3");
}

#[sqlx::test(migrator = "scene_tasks::database::migrator::MIGRATOR")]
async fn test_delete_cascades(pool: PgPool) {
    let scheduler = TaskScheduler::new(pool.clone());

    let root = scheduler.create(OWNER, None, delay(0, json!(null))).await.unwrap();
    let child = scheduler.create_child(root, delay(0, json!(null))).await.unwrap();
    let dependent = scheduler
        .create(OWNER, None, delay(0, json!(null)).with_after([root]))
        .await
        .unwrap();
    scheduler
        .listener()
        .append_task_log(root, LogSeverity::Log, "hello")
        .await
        .unwrap();

    assert!(scheduler.delete_task(root).await.unwrap());
    assert!(!scheduler.delete_task(root).await.unwrap());

    assert!(scheduler.get_task(root).await.unwrap_err().is_not_found());
    assert!(scheduler.get_task(child).await.unwrap_err().is_not_found());
    assert_eq!(TaskRelation::count_touching(&pool, root).await.unwrap(), 0);
    assert!(scheduler.get_task_logs(root, 0, None).await.unwrap().is_empty());

    let dependent = scheduler.get_task(dependent).await.unwrap();
    assert!(dependent.after.is_empty());
}

#[sqlx::test(migrator = "scene_tasks::database::migrator::MIGRATOR")]
async fn test_abort_before_start(pool: PgPool) {
    init_test_logging();
    let scheduler = TaskScheduler::new(pool);
    scheduler.start().await.unwrap();

    let id = scheduler
        .create(OWNER, None, CreateTaskParams::new("notRegistered", json!({})))
        .await
        .unwrap();

    assert_eq!(scheduler.abort(id).await.unwrap(), Some(TaskStatus::Error));
    assert_eq!(scheduler.get_task(id).await.unwrap().status, TaskStatus::Error);

    let err = scheduler.wait(id).await.unwrap_err();
    assert_eq!(
        err,
        SchedulerError::TaskFailed {
            task_id: id,
            message: format!("In task {id}: {ABORTED_BEFORE_START}"),
        }
    );

    // Already settled
    assert_eq!(scheduler.abort(id).await.unwrap(), None);
    assert!(scheduler.abort(999).await.unwrap_err().is_not_found());

    scheduler.stop().await;
}

#[sqlx::test(migrator = "scene_tasks::database::migrator::MIGRATOR")]
async fn test_abort_running_task(pool: PgPool) {
    let cluster = Cluster::start(&pool, 1).await;
    let scheduler = &cluster.scheduler;

    let id = scheduler.create(OWNER, None, delay(60_000, json!("late"))).await.unwrap();
    cluster.wait_for_status(id, TaskStatus::Running).await;

    assert_eq!(scheduler.abort(id).await.unwrap(), Some(TaskStatus::Aborting));

    let err = cluster.wait(id).await.unwrap_err();
    assert!(
        matches!(&err, SchedulerError::TaskFailed { message, .. } if message.contains("aborted")),
        "{err:?}"
    );
    assert_eq!(scheduler.get_task(id).await.unwrap().status, TaskStatus::Error);
    assert_eq!(cluster.processors[0].current_task(), None);

    cluster.shutdown().await;
}
