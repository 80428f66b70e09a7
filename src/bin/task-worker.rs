//! # Task Worker
//!
//! Runs task processors with the built-in control handlers until Ctrl-C.

use clap::Parser;
use scene_tasks::database::DatabaseConnection;
use scene_tasks::logging::init_structured_logging;
use scene_tasks::orchestration::{TaskListener, TaskProcessor};
use scene_tasks::registry::HandlerRegistry;
use scene_tasks::{SchedulerConfig, SchedulerError};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "task-worker")]
#[command(about = "Claim and execute scene tasks")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "SCENE_TASKS_CONFIG")]
    config: Option<PathBuf>,

    /// Number of processors, overrides processor.workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Do not apply pending migrations on startup
    #[arg(long)]
    skip_migrations: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_structured_logging();

    if let Err(e) = run(cli).await {
        error!(error = %e, "Task worker failed");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> scene_tasks::Result<()> {
    let mut config = SchedulerConfig::load(cli.config.as_deref())?;
    if let Some(workers) = cli.workers {
        config.processor.workers = workers;
    }
    if cli.skip_migrations {
        config.database.run_migrations = false;
    }
    config.validate()?;

    let connection = DatabaseConnection::connect(&config.database).await?;
    if !connection.health_check().await? {
        return Err(SchedulerError::DatabaseError("Database health check failed".to_string()));
    }
    let registry = Arc::new(HandlerRegistry::with_control_handlers());

    let mut processors = Vec::with_capacity(config.processor.workers);
    for _ in 0..config.processor.workers {
        let listener = TaskListener::with_config(connection.pool().clone(), config.listener.clone());
        let processor = TaskProcessor::new(listener, registry.clone());
        processor.start().await?;
        info!(processor_id = %processor.processor_id(), "Processor running");
        processors.push(processor);
    }

    info!(
        workers = processors.len(),
        types = ?registry.types(),
        "Task worker started, press Ctrl-C to stop"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    info!("Shutting down task worker");
    for processor in &processors {
        processor.stop().await;
    }
    connection.close().await;
    info!("Task worker stopped");
    Ok(())
}
