//! # Configuration
//!
//! Layered configuration for the scheduler: built-in defaults, an optional
//! configuration file, `SCENE_TASKS__*` environment variables, and finally
//! `DATABASE_URL`.

use crate::constants::system;
use crate::error::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix of environment variables read by [`SchedulerConfig::load`]
pub const ENV_PREFIX: &str = "SCENE_TASKS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub database: DatabaseConfig,
    pub listener: ListenerConfig,
    pub processor: ProcessorConfig,
    pub logs: LogsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/scene_tasks_development".to_string(),
            max_connections: 10,
            acquire_timeout_seconds: 30,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Capacity of the in-process event broadcast. Slow subscribers that fall
    /// further behind re-read task state instead of replaying events.
    pub event_buffer_size: usize,
    pub reconnect_delay_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: system::DEFAULT_EVENT_BUFFER_SIZE,
            reconnect_delay_ms: system::DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

impl ListenerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Number of processors a worker process runs. Each executes one task at a time.
    pub workers: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    pub default_page_size: i64,
    pub max_page_size: i64,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            default_page_size: system::DEFAULT_LOG_PAGE_SIZE,
            max_page_size: 500,
        }
    }
}

impl LogsConfig {
    /// Clamp a requested page size into `1..=max_page_size`
    pub fn page_size(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size)
    }
}

impl SchedulerConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: SchedulerConfig = builder.build()?.try_deserialize()?;

        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database.url = db_url;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(SchedulerError::ConfigurationError(
                "database.url must not be empty".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(SchedulerError::ConfigurationError(
                "database.max_connections must be greater than zero".to_string(),
            ));
        }
        if self.listener.event_buffer_size == 0 {
            return Err(SchedulerError::ConfigurationError(
                "listener.event_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.processor.workers == 0 {
            return Err(SchedulerError::ConfigurationError(
                "processor.workers must be greater than zero".to_string(),
            ));
        }
        // Every processor keeps one pooled connection for LISTEN
        if self.processor.workers as u64 >= u64::from(self.database.max_connections) {
            return Err(SchedulerError::ConfigurationError(format!(
                "processor.workers ({}) must be lower than database.max_connections ({})",
                self.processor.workers, self.database.max_connections
            )));
        }
        if self.logs.default_page_size <= 0 || self.logs.max_page_size < self.logs.default_page_size
        {
            return Err(SchedulerError::ConfigurationError(format!(
                "invalid log page sizes: default {} / max {}",
                self.logs.default_page_size, self.logs.max_page_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.processor.workers, 1);
        assert_eq!(config.listener.event_buffer_size, 1024);
        assert!(config.database.run_migrations);
    }

    #[test]
    fn test_validation_rejects_zero_sizes() {
        let mut config = SchedulerConfig::default();
        config.listener.event_buffer_size = 0;
        assert!(matches!(
            config.validate(),
            Err(SchedulerError::ConfigurationError(_))
        ));

        let mut config = SchedulerConfig::default();
        config.processor.workers = 0;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.database.url = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.processor.workers = config.database.max_connections as usize;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_page_size_is_clamped() {
        let logs = LogsConfig::default();
        assert_eq!(logs.page_size(None), 25);
        assert_eq!(logs.page_size(Some(0)), 1);
        assert_eq!(logs.page_size(Some(10_000)), 500);
    }

    #[test]
    fn test_load_from_file_keeps_unset_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[database]\nurl = \"postgresql://db.example/tasks\"\n\n[processor]\nworkers = 4"
        )
        .unwrap();

        let config = SchedulerConfig::load(Some(file.path())).unwrap();
        if std::env::var("DATABASE_URL").is_err() {
            assert_eq!(config.database.url, "postgresql://db.example/tasks");
        }
        assert_eq!(config.processor.workers, 4);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.logs, LogsConfig::default());
    }
}
