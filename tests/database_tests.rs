//! Pool adoption and startup migrations

use scene_tasks::database::DatabaseConnection;
use scene_tasks::error::SchedulerError;
use sqlx::PgPool;

#[sqlx::test(migrations = false)]
async fn test_with_pool_applies_migrations(pool: PgPool) {
    let connection = DatabaseConnection::with_pool(pool.clone(), true).await.unwrap();
    assert!(connection.health_check().await.unwrap());

    let (tables,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_name IN ('tasks', 'tasks_relations', 'tasks_logs')",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(tables, 3);

    // Already applied migrations are skipped
    DatabaseConnection::with_pool(pool, true).await.unwrap();
}

#[sqlx::test(migrations = false)]
async fn test_dirty_migration_is_a_migration_error(pool: PgPool) {
    sqlx::query(
        r#"
        CREATE TABLE _sqlx_migrations (
            version BIGINT PRIMARY KEY,
            description TEXT NOT NULL,
            installed_on TIMESTAMPTZ NOT NULL DEFAULT now(),
            success BOOLEAN NOT NULL,
            checksum BYTEA NOT NULL,
            execution_time BIGINT NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO _sqlx_migrations (version, description, success, checksum, execution_time) \
         VALUES (20240101000000, 'create tasks', FALSE, '\\x00', 0)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let err = DatabaseConnection::with_pool(pool, true).await.err().unwrap();
    assert!(matches!(err, SchedulerError::MigrationError(_)), "{err:?}");
}

#[sqlx::test(migrations = false)]
async fn test_migrations_can_be_skipped(pool: PgPool) {
    let connection = DatabaseConnection::with_pool(pool.clone(), false).await.unwrap();
    assert!(connection.health_check().await.unwrap());

    let (tables,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM information_schema.tables WHERE table_name = 'tasks'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(tables, 0);
}
