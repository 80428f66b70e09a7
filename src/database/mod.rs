//! # Database Operations
//!
//! Connection pooling and the embedded schema migrations for the task store.
//!
//! - [`connection`] - pool construction from [`crate::config::DatabaseConfig`]
//! - [`migrator`] - `sqlx::migrate!` over `migrations/`

pub mod connection;
pub mod migrator;

pub use connection::DatabaseConnection;
pub use migrator::{run_migrations, MIGRATOR};
