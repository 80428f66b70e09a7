//! Error types for the scene task scheduler.

use thiserror::Error;

/// SQLSTATE raised by PostgreSQL on a foreign key violation
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Message raised by the `tasks_relations` cycle guard trigger
pub const CYCLE_GUARD_MESSAGE: &str = "check_no_cycles";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Dependency error: {0}")]
    DependencyError(String),
    #[error("{message}")]
    TaskFailed { task_id: i64, message: String },
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("Listener error: {0}")]
    ListenerError(String),
    #[error("Migration error: {0}")]
    MigrationError(String),
}

impl SchedulerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => SchedulerError::NotFound(err.to_string()),
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) {
                    SchedulerError::ValidationError(format!(
                        "Referenced task does not exist: {}",
                        db_err.message()
                    ))
                } else if db_err.message().contains(CYCLE_GUARD_MESSAGE) {
                    SchedulerError::ValidationError(db_err.message().to_string())
                } else {
                    SchedulerError::DatabaseError(err.to_string())
                }
            }
            _ => SchedulerError::DatabaseError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(error: serde_json::Error) -> Self {
        SchedulerError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

impl From<config::ConfigError> for SchedulerError {
    fn from(error: config::ConfigError) -> Self {
        SchedulerError::ConfigurationError(error.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for SchedulerError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        SchedulerError::MigrationError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: SchedulerError = sqlx::Error::RowNotFound.into();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_task_failed_displays_message_verbatim() {
        let err = SchedulerError::TaskFailed {
            task_id: 12,
            message: "In task 12: boom".to_string(),
        };
        assert_eq!(err.to_string(), "In task 12: boom");
    }

    #[test]
    fn test_migrate_error_maps_to_migration_error() {
        let err: SchedulerError = sqlx::migrate::MigrateError::VersionMissing(7).into();
        assert!(matches!(err, SchedulerError::MigrationError(m) if m.contains('7')));
    }

    #[test]
    fn test_json_error_maps_to_validation() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: SchedulerError = json_err.into();
        assert!(matches!(err, SchedulerError::ValidationError(_)));
    }
}
