//! # Database Migration Support
//!
//! Schema migrations live in the root `migrations/` directory and are
//! embedded at compile time.
//!
//! ```rust,ignore
//! #[sqlx::test(migrator = "scene_tasks::database::migrator::MIGRATOR")]
//! async fn test_something(pool: PgPool) { /* ... */ }
//! ```

use sqlx::PgPool;
use tracing::info;

/// Migrator for the `tasks`, `tasks_relations` and `tasks_logs` schema
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Result type for migration operations
pub type MigrationResult<T> = Result<T, sqlx::migrate::MigrateError>;

/// Apply all pending migrations to `pool`
pub async fn run_migrations(pool: &PgPool) -> MigrationResult<()> {
    info!("Running task schema migrations");
    MIGRATOR.run(pool).await?;
    info!("Task schema migrations complete");
    Ok(())
}
