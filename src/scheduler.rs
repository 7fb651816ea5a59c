//! Background worker loops advancing the event→execution pipeline.
//!
//! Three loops share the same shape: a transaction per tick, an advisory
//! lock serialising the critical selection step across worker replicas, and
//! row-status guards as the second line of defence. The job scheduler is
//! work-conserving: after a successful dispatch it re-ticks immediately
//! until the queue is empty.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::{DatabaseConnection, DbErr, TransactionTrait};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::connectors::Registry;
use crate::db::{
    self, StoreError, ADVISORY_LOCK_CLASS, LOCK_KEY_EVENT_PROCESSING, LOCK_KEY_JOB_SCHEDULING,
    LOCK_KEY_SUBSCRIPTION_REFRESH,
};
use crate::driver::ExecutionDriver;
use crate::models::job::{self, JobSpec};
use crate::models::job_execution::{self, ExecutionStatus};
use crate::models::subscription::SubscriptionStatus;
use crate::repositories::{
    EventRepository, JobExecutionRepository, JobRepository, StepExecutionRepository,
    SubscriptionRepository,
};
use crate::scope::ProjectScope;

/// Subscriptions refreshed per tick.
const REFRESH_BATCH: u64 = 32;

/// Claims schedulable job executions under the scheduling advisory lock and
/// hands them to execution drivers.
pub struct JobScheduler {
    db: Arc<DatabaseConnection>,
    config: Arc<AppConfig>,
    shutdown: CancellationToken,
}

impl JobScheduler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            db,
            config,
            shutdown,
        }
    }

    pub async fn run(self) {
        info!("starting job scheduler");
        let interval = Duration::from_millis(self.config.scheduler.tick_interval_ms);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(interval) => {
                    loop {
                        match self.tick().await {
                            Ok(true) => continue,
                            Ok(false) => break,
                            Err(err) => {
                                error!(error = %err, "scheduler tick failed");
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("job scheduler stopped");
    }

    /// One scheduling pass. Returns whether an execution was dispatched.
    pub async fn tick(&self) -> Result<bool, StoreError> {
        let Some((execution, job, spec)) = self.claim_next().await? else {
            return Ok(false);
        };

        let driver = ExecutionDriver::new(
            self.db.clone(),
            self.config.clone(),
            self.shutdown.clone(),
        );

        // The claim is committed; the driver may run in the background
        // without relying on any pre-commit in-memory state.
        tokio::spawn(async move {
            driver.run(execution, job, spec).await;
        });

        Ok(true)
    }

    /// Selects and claims the next schedulable execution under the advisory
    /// lock, returning it together with its job and parsed spec.
    pub async fn claim_next(
        &self,
    ) -> Result<Option<(job_execution::Model, job::Model, JobSpec)>, StoreError> {
        let txn = self.db.begin().await.map_err(StoreError::from)?;

        db::take_advisory_lock(&txn, ADVISORY_LOCK_CLASS, LOCK_KEY_JOB_SCHEDULING).await?;

        let now = Utc::now().fixed_offset();

        let Some(execution) = JobExecutionRepository::load_for_scheduling(&txn, now).await? else {
            txn.commit().await.map_err(StoreError::from)?;
            return Ok(None);
        };

        info!(execution_id = %execution.id, "processing job execution");

        if !JobExecutionRepository::start(&txn, execution.id, now).await? {
            // Another worker won the row between selection and transition.
            txn.rollback().await.map_err(StoreError::from)?;
            return Ok(None);
        }

        // Everything after the claim is scoped to the execution's project.
        let scope = ProjectScope::new(execution.project_id);

        let Some(job) =
            JobRepository::load_by_id(&txn, execution.job_id, Some(&scope)).await?
        else {
            return Err(StoreError::Fatal(DbErr::Custom(format!(
                "job {} of execution {} not found",
                execution.job_id, execution.id
            ))));
        };

        let spec = match job.parse_spec() {
            Ok(spec) => spec,
            Err(err) => {
                // A malformed spec can never run; fail the execution in
                // place instead of rescheduling it forever.
                warn!(
                    execution_id = %execution.id,
                    job_id = %job.id,
                    error = %err,
                    "job specification is invalid"
                );
                StepExecutionRepository::abort_remaining(&txn, execution.id).await?;
                JobExecutionRepository::finish(
                    &txn,
                    execution.id,
                    ExecutionStatus::Aborted,
                    Some(&err.to_string()),
                )
                .await?;
                txn.commit().await.map_err(StoreError::from)?;
                return Ok(None);
            }
        };

        txn.commit().await.map_err(StoreError::from)?;

        let mut execution = execution;
        execution.status = ExecutionStatus::Started.as_str().to_string();
        execution.started_at = Some(now);

        Ok(Some((execution, job, spec)))
    }
}

/// Consumes unprocessed bound events oldest-first, materialising a job
/// execution and its step rows from the subscription's job.
pub struct EventProcessor {
    db: Arc<DatabaseConnection>,
    config: Arc<AppConfig>,
    shutdown: CancellationToken,
}

impl EventProcessor {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            db,
            config,
            shutdown,
        }
    }

    pub async fn run(self) {
        info!("starting event processor");
        let interval = Duration::from_millis(self.config.scheduler.event_tick_interval_ms);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(interval) => {
                    loop {
                        match self.tick().await {
                            Ok(true) => continue,
                            Ok(false) => break,
                            Err(err) => {
                                error!(error = %err, "event processor tick failed");
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("event processor stopped");
    }

    /// Processes one bound event. Returns whether an event was consumed.
    pub async fn tick(&self) -> Result<bool, StoreError> {
        let txn = self.db.begin().await.map_err(StoreError::from)?;

        db::take_advisory_lock(&txn, ADVISORY_LOCK_CLASS, LOCK_KEY_EVENT_PROCESSING).await?;

        let Some(event) = EventRepository::next_unprocessed(&txn).await? else {
            txn.commit().await.map_err(StoreError::from)?;
            return Ok(false);
        };

        let scope = ProjectScope::new(event.project_id);

        let Some(subscription_id) = event.subscription_id else {
            return Err(StoreError::Fatal(DbErr::Custom(format!(
                "event {} selected for processing without subscription",
                event.id
            ))));
        };

        let subscription =
            SubscriptionRepository::load_by_id(&txn, subscription_id, Some(&scope)).await?;

        let job = match &subscription {
            Some(subscription)
                if subscription.status == SubscriptionStatus::Active.as_str() =>
            {
                JobRepository::load_by_id(&txn, subscription.job_id, Some(&scope)).await?
            }
            _ => None,
        };

        let runnable = job.filter(|job| !job.disabled);

        match runnable {
            Some(job) => match job.parse_spec() {
                Ok(spec) => {
                    let execution = JobExecutionRepository::create(
                        &txn,
                        event.project_id,
                        job.id,
                        Some(event.id),
                        Utc::now().fixed_offset(),
                        spec.steps.len() as i32,
                    )
                    .await?;

                    StepExecutionRepository::create_for_execution(
                        &txn,
                        &execution,
                        spec.steps.len(),
                    )
                    .await?;

                    info!(
                        event_id = %event.id,
                        execution_id = %execution.id,
                        job_id = %job.id,
                        "event materialised into job execution"
                    );
                }
                Err(err) => {
                    warn!(
                        event_id = %event.id,
                        job_id = %job.id,
                        error = %err,
                        "event skipped: job specification is invalid"
                    );
                }
            },
            None => {
                debug!(
                    event_id = %event.id,
                    "event skipped: no runnable job behind subscription"
                );
            }
        }

        EventRepository::mark_processed(&txn, event).await?;

        txn.commit().await.map_err(StoreError::from)?;

        Ok(true)
    }
}

/// Drives periodic connectors: picks due subscriptions and invokes their
/// connector's refresh hook, advancing the update bookkeeping.
pub struct SubscriptionRefresher {
    db: Arc<DatabaseConnection>,
    config: Arc<AppConfig>,
    shutdown: CancellationToken,
}

impl SubscriptionRefresher {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            db,
            config,
            shutdown,
        }
    }

    pub async fn run(self) {
        info!("starting subscription refresher");
        let interval = Duration::from_millis(self.config.scheduler.refresh_tick_interval_ms);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(interval) => {
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "subscription refresher tick failed");
                    }
                }
            }
        }

        info!("subscription refresher stopped");
    }

    /// Refreshes every due subscription once. Returns how many were
    /// refreshed.
    pub async fn tick(&self) -> Result<usize, StoreError> {
        let txn = self.db.begin().await.map_err(StoreError::from)?;

        db::take_advisory_lock(&txn, ADVISORY_LOCK_CLASS, LOCK_KEY_SUBSCRIPTION_REFRESH).await?;

        let now = Utc::now().fixed_offset();
        let due = SubscriptionRepository::due_for_refresh(&txn, now, REFRESH_BATCH).await?;
        let mut refreshed = 0;

        for subscription in due {
            match Registry::lookup(&subscription.connector) {
                Ok(connector) => {
                    if let Err(err) = connector.refresh_subscription(&txn, &subscription).await {
                        warn!(
                            subscription_id = %subscription.id,
                            connector = %subscription.connector,
                            error = %err,
                            "subscription refresh failed"
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        subscription_id = %subscription.id,
                        error = %err,
                        "subscription refresh skipped"
                    );
                }
            }

            // Advance the bookkeeping regardless of the refresh outcome so a
            // broken subscription cannot hot-loop the refresher.
            SubscriptionRepository::mark_refreshed(&txn, subscription, now).await?;
            refreshed += 1;
        }

        txn.commit().await.map_err(StoreError::from)?;

        Ok(refreshed)
    }
}
