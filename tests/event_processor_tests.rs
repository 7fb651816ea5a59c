//! Event processor and subscription refresher behavior.

#[path = "test_utils/mod.rs"]
mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use jobline::models::event;
use jobline::models::job_execution::ExecutionStatus;
use jobline::models::subscription::SubscriptionStatus;
use jobline::repositories::{
    EventRepository, JobExecutionRepository, JobRepository, SubscriptionRepository,
};
use jobline::scheduler::{EventProcessor, SubscriptionRefresher};

use test_utils::{
    create_bound_event, create_github_subscription, create_job, create_project, load_steps,
    setup_test_db, test_config,
};

fn echo_spec() -> serde_json::Value {
    json!({
        "runner": {"name": "local"},
        "steps": [{"command": "echo one"}, {"command": "echo two"}],
    })
}

#[tokio::test]
async fn bound_event_materialises_execution_and_steps() -> Result<()> {
    let db = setup_test_db().await?;
    let root = tempfile::tempdir()?;
    let project_id = create_project(&db).await?;
    let job = create_job(&db, project_id, "echo", echo_spec()).await?;
    let subscription =
        create_github_subscription(&db, project_id, job.id, "push", "acme", None).await?;
    let event = create_bound_event(&db, &subscription, "push", json!({"branch": "main"})).await?;

    let processor = EventProcessor::new(
        Arc::new(db.clone()),
        Arc::new(test_config(root.path())),
        CancellationToken::new(),
    );

    assert!(processor.tick().await?);

    let executions = JobExecutionRepository::list_for_job(&db, job.id, None).await?;
    assert_eq!(executions.len(), 1);
    let execution = &executions[0];
    assert_eq!(execution.status, ExecutionStatus::Created.as_str());
    assert_eq!(execution.event_id, Some(event.id));
    assert_eq!(execution.step_count, 2);
    assert_eq!(execution.project_id, project_id);

    let steps = load_steps(&db, execution.id).await?;
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].position, 1);
    assert_eq!(steps[1].position, 2);
    assert!(steps.iter().all(|step| step.status == "created"));

    let stored_event = EventRepository::load_by_id(&db, event.id, None).await?.unwrap();
    assert!(stored_event.processed);
    assert!(stored_event.processed_at.is_some());

    Ok(())
}

#[tokio::test]
async fn raw_events_are_never_processed() -> Result<()> {
    let db = setup_test_db().await?;
    let root = tempfile::tempdir()?;
    let project_id = create_project(&db).await?;

    EventRepository::insert_raw(&db, project_id, "github", "raw", json!({"n": 1}), None).await?;

    let processor = EventProcessor::new(
        Arc::new(db.clone()),
        Arc::new(test_config(root.path())),
        CancellationToken::new(),
    );

    assert!(!processor.tick().await?);

    let raw = event::Entity::find()
        .filter(event::Column::Name.eq("raw"))
        .one(&db)
        .await?
        .unwrap();
    assert!(!raw.processed);

    Ok(())
}

#[tokio::test]
async fn events_for_disabled_jobs_are_consumed_without_executions() -> Result<()> {
    let db = setup_test_db().await?;
    let root = tempfile::tempdir()?;
    let project_id = create_project(&db).await?;
    let job = create_job(&db, project_id, "echo", echo_spec()).await?;
    let subscription =
        create_github_subscription(&db, project_id, job.id, "push", "acme", None).await?;
    create_bound_event(&db, &subscription, "push", json!({})).await?;

    JobRepository::disable(&db, job.id, None).await?;

    let processor = EventProcessor::new(
        Arc::new(db.clone()),
        Arc::new(test_config(root.path())),
        CancellationToken::new(),
    );

    assert!(processor.tick().await?);

    let executions = JobExecutionRepository::list_for_job(&db, job.id, None).await?;
    assert!(executions.is_empty());

    Ok(())
}

#[tokio::test]
async fn events_for_inactive_subscriptions_are_consumed_without_executions() -> Result<()> {
    let db = setup_test_db().await?;
    let root = tempfile::tempdir()?;
    let project_id = create_project(&db).await?;
    let job = create_job(&db, project_id, "echo", echo_spec()).await?;
    let subscription =
        create_github_subscription(&db, project_id, job.id, "push", "acme", None).await?;
    create_bound_event(&db, &subscription, "push", json!({})).await?;

    SubscriptionRepository::set_status(&db, subscription, SubscriptionStatus::Inactive).await?;

    let processor = EventProcessor::new(
        Arc::new(db.clone()),
        Arc::new(test_config(root.path())),
        CancellationToken::new(),
    );

    assert!(processor.tick().await?);

    let executions = JobExecutionRepository::list_for_job(&db, job.id, None).await?;
    assert!(executions.is_empty());

    Ok(())
}

#[tokio::test]
async fn events_are_consumed_oldest_first() -> Result<()> {
    let db = setup_test_db().await?;
    let root = tempfile::tempdir()?;
    let project_id = create_project(&db).await?;
    let job = create_job(&db, project_id, "echo", echo_spec()).await?;
    let subscription =
        create_github_subscription(&db, project_id, job.id, "push", "acme", None).await?;

    let first = create_bound_event(&db, &subscription, "push", json!({"n": 1})).await?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = create_bound_event(&db, &subscription, "push", json!({"n": 2})).await?;

    let processor = EventProcessor::new(
        Arc::new(db.clone()),
        Arc::new(test_config(root.path())),
        CancellationToken::new(),
    );

    assert!(processor.tick().await?);

    let first_stored = EventRepository::load_by_id(&db, first.id, None).await?.unwrap();
    let second_stored = EventRepository::load_by_id(&db, second.id, None).await?.unwrap();
    assert!(first_stored.processed);
    assert!(!second_stored.processed);

    assert!(processor.tick().await?);
    assert!(!processor.tick().await?);

    Ok(())
}

#[tokio::test]
async fn refresher_emits_tick_events_for_due_time_subscriptions() -> Result<()> {
    let db = setup_test_db().await?;
    let root = tempfile::tempdir()?;
    let config = Arc::new(test_config(root.path()));

    jobline::connectors::Registry::initialize(&config).await?;

    let project_id = create_project(&db).await?;
    let job = create_job(&db, project_id, "cron", echo_spec()).await?;
    let subscription =
        SubscriptionRepository::create_periodic(&db, project_id, job.id, "time", "tick", 60)
            .await?;

    let refresher = SubscriptionRefresher::new(
        Arc::new(db.clone()),
        config.clone(),
        CancellationToken::new(),
    );

    assert_eq!(refresher.tick().await?, 1);

    let ticks = event::Entity::find()
        .filter(event::Column::Name.eq("tick"))
        .all(&db)
        .await?;
    assert_eq!(ticks.len(), 1);
    assert_eq!(ticks[0].subscription_id, Some(subscription.id));

    // The subscription is no longer due until its delay passes.
    assert_eq!(refresher.tick().await?, 0);

    let refreshed = SubscriptionRepository::load_by_id(&db, subscription.id, None)
        .await?
        .unwrap();
    assert!(refreshed.last_update.is_some());
    assert!(refreshed.next_update.unwrap() > Utc::now().fixed_offset());

    Ok(())
}
