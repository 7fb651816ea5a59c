//! Test utilities for database-backed integration tests.
//!
//! Suites run against an in-memory SQLite database with all migrations
//! applied. The pool is pinned to a single connection so every query in a
//! test sees the same database.

#![allow(dead_code)]

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use migration::{Migrator, MigratorTrait};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use jobline::config::AppConfig;
use jobline::models::job::{self, JobSpec};
use jobline::models::job_execution::{self, ExecutionStatus};
use jobline::models::{step_execution, subscription};
use jobline::repositories::{
    EventRepository, JobExecutionRepository, JobRepository, StepExecutionRepository,
    SubscriptionRepository,
};

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);

    let db = Database::connect(options).await?;

    Migrator::up(&db, None).await?;

    // SQLite enforces foreign keys by default under sqlx; relax them so
    // fixtures do not need the full relation graph.
    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = OFF".to_string(),
    ))
    .await?;

    Ok(db)
}

/// Configuration tuned for fast test cadences, rooted at the given runner
/// directory.
pub fn test_config(runner_root: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.profile = "test".to_string();
    config.github_webhook_key = Some("test-webhook-key".to_string());
    config.scheduler.tick_interval_ms = 20;
    config.scheduler.event_tick_interval_ms = 20;
    config.scheduler.refresh_tick_interval_ms = 20;
    config.runner.local_root_directory = runner_root.to_string_lossy().into_owned();
    config.runner.output_flush_interval_ms = 20;
    config.runner.abort_poll_interval_ms = 20;
    config.runner.termination_grace_seconds = 2;
    config
}

/// Creates a project row and returns its id.
pub async fn create_project(db: &DatabaseConnection) -> Result<Uuid> {
    let id = Uuid::new_v4();

    db.execute(Statement::from_sql_and_values(
        db.get_database_backend(),
        "INSERT INTO projects (id, name, created_at) VALUES (?, ?, ?)",
        vec![
            id.into(),
            format!("project-{id}").into(),
            Utc::now().fixed_offset().into(),
        ],
    ))
    .await?;

    Ok(id)
}

/// Creates a job from a JSON spec.
pub async fn create_job(
    db: &DatabaseConnection,
    project_id: Uuid,
    name: &str,
    spec: JsonValue,
) -> Result<job::Model> {
    let spec = JobSpec::from_value(spec)?;
    Ok(JobRepository::create(db, project_id, name, &spec).await?)
}

/// Creates an active github subscription for `(organization, repository)`.
pub async fn create_github_subscription(
    db: &DatabaseConnection,
    project_id: Uuid,
    job_id: Uuid,
    event: &str,
    organization: &str,
    repository: Option<&str>,
) -> Result<subscription::Model> {
    Ok(SubscriptionRepository::create_github(
        db,
        project_id,
        job_id,
        event,
        organization,
        repository,
        None,
    )
    .await?)
}

/// Inserts a bound event for the subscription.
pub async fn create_bound_event(
    db: &DatabaseConnection,
    subscription: &subscription::Model,
    name: &str,
    data: JsonValue,
) -> Result<jobline::models::event::Model> {
    Ok(EventRepository::insert_bound(db, subscription, name, data, None).await?)
}

/// Creates a `created` execution with its step rows, due at `scheduled_at`.
pub async fn create_execution(
    db: &DatabaseConnection,
    job: &job::Model,
    scheduled_at: DateTimeWithTimeZone,
) -> Result<job_execution::Model> {
    let spec = job.parse_spec()?;

    let execution = JobExecutionRepository::create(
        db,
        job.project_id,
        job.id,
        None,
        scheduled_at,
        spec.steps.len() as i32,
    )
    .await?;

    StepExecutionRepository::create_for_execution(db, &execution, spec.steps.len()).await?;

    Ok(execution)
}

/// Polls until the execution reaches a terminal status or the timeout
/// passes.
pub async fn wait_for_terminal(
    db: &DatabaseConnection,
    execution_id: Uuid,
    timeout: Duration,
) -> Result<job_execution::Model> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let execution = JobExecutionRepository::load_by_id(db, execution_id, None)
            .await?
            .ok_or_else(|| anyhow::anyhow!("execution {execution_id} not found"))?;

        if matches!(
            execution.execution_status(),
            Some(ExecutionStatus::Successful | ExecutionStatus::Failed | ExecutionStatus::Aborted)
        ) {
            return Ok(execution);
        }

        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "execution {execution_id} still '{}' after {timeout:?}",
                execution.status
            );
        }

        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Polls until the execution leaves the given status.
pub async fn wait_for_status_change(
    db: &DatabaseConnection,
    execution_id: Uuid,
    from: ExecutionStatus,
    timeout: Duration,
) -> Result<job_execution::Model> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let execution = JobExecutionRepository::load_by_id(db, execution_id, None)
            .await?
            .ok_or_else(|| anyhow::anyhow!("execution {execution_id} not found"))?;

        if execution.status != from.as_str() {
            return Ok(execution);
        }

        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("execution {execution_id} still '{}'", execution.status);
        }

        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Steps of an execution ordered by position.
pub async fn load_steps(
    db: &DatabaseConnection,
    execution_id: Uuid,
) -> Result<Vec<step_execution::Model>> {
    Ok(StepExecutionRepository::load_for_execution(db, execution_id).await?)
}
