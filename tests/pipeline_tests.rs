//! End-to-end pipeline tests: bound event → event processor → scheduler →
//! execution driver → terminal state, using the local runner.

#[path = "test_utils/mod.rs"]
mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sea_orm::DatabaseConnection;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use jobline::config::AppConfig;
use jobline::models::job_execution::ExecutionStatus;
use jobline::models::step_execution::StepStatus;
use jobline::repositories::JobExecutionRepository;
use jobline::scheduler::{EventProcessor, JobScheduler};

use test_utils::{
    create_bound_event, create_github_subscription, create_job, create_project, load_steps,
    setup_test_db, test_config, wait_for_status_change, wait_for_terminal,
};

struct Pipeline {
    db: DatabaseConnection,
    config: Arc<AppConfig>,
    processor: EventProcessor,
    scheduler: JobScheduler,
    _root: tempfile::TempDir,
}

async fn pipeline() -> Result<Pipeline> {
    let db = setup_test_db().await?;
    let root = tempfile::tempdir()?;
    let config = Arc::new(test_config(root.path()));
    let shutdown = CancellationToken::new();

    let shared = Arc::new(db.clone());
    let processor = EventProcessor::new(shared.clone(), config.clone(), shutdown.clone());
    let scheduler = JobScheduler::new(shared, config.clone(), shutdown);

    Ok(Pipeline {
        db,
        config,
        processor,
        scheduler,
        _root: root,
    })
}

#[tokio::test]
async fn schedule_and_run_a_single_step_job() -> Result<()> {
    let p = pipeline().await?;
    let project_id = create_project(&p.db).await?;

    let job = create_job(
        &p.db,
        project_id,
        "greeter",
        json!({
            "runner": {"name": "local"},
            "steps": [{"command": "echo hello"}],
        }),
    )
    .await?;

    let subscription = create_github_subscription(
        &p.db,
        project_id,
        job.id,
        "push",
        "acme",
        Some("tool"),
    )
    .await?;

    let event = create_bound_event(&p.db, &subscription, "push", json!({"branch": "main"})).await?;

    // First tick materialises the execution, second finds nothing.
    assert!(p.processor.tick().await?);
    assert!(!p.processor.tick().await?);

    let executions = JobExecutionRepository::list_for_job(&p.db, job.id, None).await?;
    assert_eq!(executions.len(), 1);
    let execution = &executions[0];
    assert_eq!(execution.event_id, Some(event.id));
    assert_eq!(execution.step_count, 1);

    assert!(p.scheduler.tick().await?);

    let finished = wait_for_terminal(&p.db, execution.id, Duration::from_secs(10)).await?;
    assert_eq!(finished.status, ExecutionStatus::Successful.as_str());
    assert!(finished.finished_at.is_some());
    assert!(finished.failure_message.is_none());

    let steps = load_steps(&p.db, execution.id).await?;
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Successful.as_str());
    assert!(steps[0]
        .output
        .as_deref()
        .unwrap_or_default()
        .contains("hello"));

    Ok(())
}

#[tokio::test]
async fn step_failure_fails_the_execution_and_skips_the_rest() -> Result<()> {
    let p = pipeline().await?;
    let project_id = create_project(&p.db).await?;

    let job = create_job(
        &p.db,
        project_id,
        "flaky",
        json!({
            "runner": {"name": "local"},
            "steps": [
                {"command": "echo one"},
                {"command": "exit 2"},
                {"command": "echo three"},
            ],
        }),
    )
    .await?;

    let subscription =
        create_github_subscription(&p.db, project_id, job.id, "push", "acme", None).await?;
    create_bound_event(&p.db, &subscription, "push", json!({})).await?;

    assert!(p.processor.tick().await?);
    assert!(p.scheduler.tick().await?);

    let executions = JobExecutionRepository::list_for_job(&p.db, job.id, None).await?;
    let finished = wait_for_terminal(&p.db, executions[0].id, Duration::from_secs(10)).await?;

    assert_eq!(finished.status, ExecutionStatus::Failed.as_str());
    assert_eq!(
        finished.failure_message.as_deref(),
        Some("program exited with status 2")
    );

    let steps = load_steps(&p.db, finished.id).await?;
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[0].status, StepStatus::Successful.as_str());
    assert_eq!(steps[1].status, StepStatus::Failed.as_str());
    assert_eq!(
        steps[1].failure_message.as_deref(),
        Some("program exited with status 2")
    );
    assert_eq!(steps[2].status, StepStatus::Aborted.as_str());
    assert!(steps[2].started_at.is_none());

    Ok(())
}

#[tokio::test]
async fn requested_abort_cancels_a_running_step() -> Result<()> {
    let p = pipeline().await?;
    let project_id = create_project(&p.db).await?;

    let job = create_job(
        &p.db,
        project_id,
        "sleeper",
        json!({
            "runner": {"name": "local"},
            "steps": [{"command": "sleep 30"}],
        }),
    )
    .await?;

    let subscription =
        create_github_subscription(&p.db, project_id, job.id, "push", "acme", None).await?;
    create_bound_event(&p.db, &subscription, "push", json!({})).await?;

    assert!(p.processor.tick().await?);
    assert!(p.scheduler.tick().await?);

    let executions = JobExecutionRepository::list_for_job(&p.db, job.id, None).await?;
    let execution_id = executions[0].id;

    // Wait until the driver owns the execution, then ask for an abort.
    wait_for_status_change(
        &p.db,
        execution_id,
        ExecutionStatus::Created,
        Duration::from_secs(5),
    )
    .await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(JobExecutionRepository::request_abort(&p.db, execution_id, None).await?);

    let finished = wait_for_terminal(&p.db, execution_id, Duration::from_secs(10)).await?;
    assert_eq!(finished.status, ExecutionStatus::Aborted.as_str());
    assert_eq!(finished.failure_message.as_deref(), Some("context canceled"));

    let steps = load_steps(&p.db, execution_id).await?;
    assert_eq!(steps[0].status, StepStatus::Aborted.as_str());

    Ok(())
}

#[tokio::test]
async fn execution_deadline_aborts_a_stuck_step() -> Result<()> {
    let p = pipeline().await?;
    let project_id = create_project(&p.db).await?;

    let job = create_job(
        &p.db,
        project_id,
        "deadline",
        json!({
            "runner": {"name": "local"},
            "steps": [{"command": "sleep 30"}],
            "timeout_seconds": 1,
        }),
    )
    .await?;

    let subscription =
        create_github_subscription(&p.db, project_id, job.id, "push", "acme", None).await?;
    create_bound_event(&p.db, &subscription, "push", json!({})).await?;

    assert!(p.processor.tick().await?);
    assert!(p.scheduler.tick().await?);

    let executions = JobExecutionRepository::list_for_job(&p.db, job.id, None).await?;
    let finished = wait_for_terminal(&p.db, executions[0].id, Duration::from_secs(15)).await?;

    assert_eq!(finished.status, ExecutionStatus::Aborted.as_str());
    assert_eq!(
        finished.failure_message.as_deref(),
        Some("execution deadline exceeded")
    );

    Ok(())
}

#[tokio::test]
async fn multi_step_jobs_share_environment_and_directory() -> Result<()> {
    let p = pipeline().await?;
    let project_id = create_project(&p.db).await?;

    let job = create_job(
        &p.db,
        project_id,
        "stages",
        json!({
            "runner": {"name": "local"},
            "environment": {"GREETING": "bonjour"},
            "steps": [
                {"command": "echo $GREETING > state"},
                {"command": "cat {{dir}}/state"},
                {"command": "echo step=$JOBLINE_STEP_NUMBER"},
            ],
        }),
    )
    .await?;

    let subscription =
        create_github_subscription(&p.db, project_id, job.id, "push", "acme", None).await?;
    create_bound_event(&p.db, &subscription, "push", json!({})).await?;

    assert!(p.processor.tick().await?);
    assert!(p.scheduler.tick().await?);

    let executions = JobExecutionRepository::list_for_job(&p.db, job.id, None).await?;
    let finished = wait_for_terminal(&p.db, executions[0].id, Duration::from_secs(10)).await?;
    assert_eq!(finished.status, ExecutionStatus::Successful.as_str());

    let steps = load_steps(&p.db, finished.id).await?;
    assert!(steps[1]
        .output
        .as_deref()
        .unwrap_or_default()
        .contains("bonjour"));
    assert!(steps[2]
        .output
        .as_deref()
        .unwrap_or_default()
        .contains("step=3"));

    // The runner cleaned its working directory on terminate.
    let dir = std::path::Path::new(&p.config.runner.local_root_directory)
        .join(finished.id.to_string());
    assert!(!dir.exists());

    Ok(())
}
