use crate::config::DatabaseConfig;
use crate::database::migrator;
use crate::error::Result;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tracing::{debug, info};

pub struct DatabaseConnection {
    pool: PgPool,
}

impl DatabaseConnection {
    /// Connect a pool from `config`, applying pending migrations when
    /// `run_migrations` is set.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = Self::pool_options(config).connect(&config.url).await?;
        info!(
            max_connections = config.max_connections,
            "Database connection established"
        );
        Self::with_pool(pool, config.run_migrations).await
    }

    /// Adopt an existing pool, optionally migrating it first
    pub async fn with_pool(pool: PgPool, run_migrations: bool) -> Result<Self> {
        if run_migrations {
            migrator::run_migrations(&pool).await?;
        } else {
            debug!("Skipping migrations");
        }
        Ok(Self { pool })
    }

    fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .test_before_acquire(true)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<bool> {
        let row = sqlx::query("SELECT 1 as health")
            .fetch_one(&self.pool)
            .await?;

        let health: i32 = row.get("health");
        Ok(health == 1)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
