#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Scene Tasks
//!
//! Durable DAG task scheduler for scene asset processing (model baking,
//! transcoding, texture compression, document assembly) on PostgreSQL.
//!
//! ## Overview
//!
//! Tasks are rows in a dependency graph. Any number of worker processes race
//! to claim ready rows with `FOR UPDATE SKIP LOCKED`, run the handler
//! registered for the task type and store its output. `LISTEN/NOTIFY`
//! channels, one per status, wake workers and waiters without polling.
//!
//! ## Module Organization
//!
//! - [`models`] - tasks, dependency edges, logs and task trees
//! - [`database`] - connection pool and embedded migrations
//! - [`state_machine`] - status vocabulary and its pessimism order
//! - [`orchestration`] - listener, processor, scheduler, single-flight guard
//! - [`registry`] - handler trait and lookup by task type
//! - [`handlers`] - built-in control handlers (delay, error, group, reduce)
//! - [`config`] - layered configuration
//! - [`logging`] - structured logging setup
//! - [`error`] - structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scene_tasks::models::CreateTaskParams;
//! use scene_tasks::orchestration::{TaskProcessor, TaskScheduler};
//! use scene_tasks::registry::HandlerRegistry;
//! use serde_json::json;
//! use sqlx::PgPool;
//! use std::sync::Arc;
//!
//! # async fn example(pool: PgPool) -> scene_tasks::Result<()> {
//! let processor = TaskProcessor::from_pool(pool.clone(), Arc::new(HandlerRegistry::with_control_handlers()));
//! processor.start().await?;
//!
//! let scheduler = TaskScheduler::new(pool);
//! scheduler.start().await?;
//!
//! let first = scheduler
//!     .create(1, None, CreateTaskParams::new("delayTask", json!({"time": 0, "value": 1})))
//!     .await?;
//! let second = scheduler
//!     .create(1, None, CreateTaskParams::new("delayTask", json!({"time": 0})).with_after([first]))
//!     .await?;
//! scheduler.wait(second).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Integration tests use SQLx native testing with one database per test:
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # All tests, needs DATABASE_URL
//! ```

pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod state_machine;

pub use config::SchedulerConfig;
pub use constants::{LogSeverity, TaskStatus};
pub use error::{Result, SchedulerError};
pub use models::{CreateTaskParams, Task, TaskEvent, TaskListQuery, TaskLog, TaskTreeNode};
pub use orchestration::{TaskHandlerContext, TaskListener, TaskProcessor, TaskScheduler};
pub use registry::{HandlerRegistry, TaskHandler};
