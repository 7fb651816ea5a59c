//! # Jobline Main Entry Point
//!
//! Starts the webhook ingress server together with the scheduler, event
//! processor, and subscription refresher loops.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use jobline::{
    config::ConfigLoader,
    connectors::Registry,
    db,
    scheduler::{EventProcessor, JobScheduler, SubscriptionRefresher},
    server::run_server,
    telemetry,
};
use migration::{Migrator, MigratorTrait};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "jobline")]
#[command(about = "Event-driven job orchestration service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Rollback the last migration
    Down,
    /// Show migration status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Arc::new(ConfigLoader::new().load()?);
    telemetry::init_tracing(&config)?;

    let db = db::init_pool(&config).await?;

    if let Some(command) = cli.command {
        match command {
            Commands::Migrate { action } => {
                handle_migrate_command(&db, action).await?;
                return Ok(());
            }
        }
    }

    // Local and test profiles migrate automatically on start.
    if config.profile == "local" || config.profile == "test" {
        info!(profile = %config.profile, "running migrations");
        Migrator::up(&db, None).await?;
    }

    Registry::initialize(&config).await?;

    if let Ok(redacted) = config.redacted_json() {
        info!(profile = %config.profile, configuration = %redacted, "configuration loaded");
    }

    let shutdown = CancellationToken::new();
    let db = Arc::new(db);

    let scheduler = JobScheduler::new(db.clone(), config.clone(), shutdown.clone());
    let scheduler_task = tokio::spawn(scheduler.run());

    let processor = EventProcessor::new(db.clone(), config.clone(), shutdown.clone());
    let processor_task = tokio::spawn(processor.run());

    let refresher = SubscriptionRefresher::new(db.clone(), config.clone(), shutdown.clone());
    let refresher_task = tokio::spawn(refresher.run());

    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(run_server(
        config.clone(),
        db.as_ref().clone(),
        server_shutdown,
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.cancel();

    let _ = scheduler_task.await;
    let _ = processor_task.await;
    let _ = refresher_task.await;
    if let Ok(result) = server_task.await {
        result?;
    }

    Registry::terminate().await;

    info!("shutdown complete");

    Ok(())
}

async fn handle_migrate_command(
    db: &DatabaseConnection,
    action: MigrateAction,
) -> anyhow::Result<()> {
    match action {
        MigrateAction::Up => {
            println!("Applying migrations...");
            Migrator::up(db, None).await?;
            println!("All migrations applied successfully");
        }
        MigrateAction::Down => {
            println!("Rolling back last migration...");
            Migrator::down(db, Some(1)).await?;
            println!("Migration rolled back successfully");
        }
        MigrateAction::Status => {
            let applied = Migrator::get_applied_migrations(db).await?;
            let pending = Migrator::get_pending_migrations(db).await?;

            println!("Applied migrations: {}", applied.len());
            println!("Pending migrations: {}", pending.len());
        }
    }
    Ok(())
}
