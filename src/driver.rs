//! Execution driver: drives a started job execution through its steps.
//!
//! The driver owns the runner behaviour for the lifetime of the execution;
//! both terminate together. Execution state stays DB-resident so a crashed
//! driver never strands in-memory-only progress.

use std::sync::Arc;
use std::time::Duration;

use sea_orm::DatabaseConnection;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::StoreError;
use crate::models::job::{self, JobSpec};
use crate::models::job_execution::{self, ExecutionStatus};
use crate::models::step_execution::StepStatus;
use crate::output::OutputSink;
use crate::repositories::{JobExecutionRepository, StepExecutionRepository};
use crate::runners::{self, RunnerContext, RunnerError};

/// Failure message recorded when cancellation interrupts an execution.
const CANCELED_MESSAGE: &str = "context canceled";
/// Failure message recorded when the job's wall-clock deadline passes.
const DEADLINE_MESSAGE: &str = "execution deadline exceeded";

enum Outcome {
    Successful,
    Failed(String),
    Aborted(String),
}

pub struct ExecutionDriver {
    db: Arc<DatabaseConnection>,
    config: Arc<AppConfig>,
    shutdown: CancellationToken,
}

impl ExecutionDriver {
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

    /// Runs a started execution to completion. Errors are terminal for the
    /// execution, never for the worker.
    pub async fn run(&self, execution: job_execution::Model, job: job::Model, spec: JobSpec) {
        let execution_id = execution.id;

        if let Err(err) = self.drive(execution, job, spec).await {
            error!(
                execution_id = %execution_id,
                error = %err,
                "execution driver failed"
            );

            let _ = JobExecutionRepository::finish(
                &*self.db,
                execution_id,
                ExecutionStatus::Aborted,
                Some(&err.to_string()),
            )
            .await;
            let _ = StepExecutionRepository::abort_remaining(&*self.db, execution_id).await;
        }
    }

    async fn drive(
        &self,
        execution: job_execution::Model,
        job: job::Model,
        spec: JobSpec,
    ) -> Result<(), StoreError> {
        let cancel = self.shutdown.child_token();
        let watcher = self.spawn_abort_watcher(execution.id, cancel.clone());

        let deadline = spec
            .timeout_seconds
            .map(|seconds| tokio::time::Instant::now() + Duration::from_secs(seconds));

        let ctx = Arc::new(RunnerContext::new(
            execution.clone(),
            job,
            spec.clone(),
            cancel.clone(),
        ));

        let mut runner = match runners::instantiate(&spec.runner.name, &self.config, ctx) {
            Ok(runner) => runner,
            Err(err) => {
                watcher.abort();
                return self
                    .finalize(&execution, Outcome::Aborted(err.to_string()))
                    .await;
            }
        };

        info!(
            execution_id = %execution.id,
            job_id = %execution.job_id,
            runner = %spec.runner.name,
            steps = spec.steps.len(),
            "running job execution"
        );

        if let Err(err) = runner.init().await {
            warn!(
                execution_id = %execution.id,
                error = %err,
                "runner initialisation failed"
            );
            runner.terminate().await;
            watcher.abort();
            return self
                .finalize(&execution, Outcome::Aborted(err.to_string()))
                .await;
        }

        let steps = StepExecutionRepository::load_for_execution(&*self.db, execution.id).await?;

        let mut outcome = Outcome::Successful;

        for step_row in steps {
            let Some(step_spec) = spec.steps.get((step_row.position - 1) as usize).cloned()
            else {
                outcome = Outcome::Aborted(format!(
                    "step {} has no specification",
                    step_row.position
                ));
                break;
            };

            if cancel.is_cancelled() {
                outcome = Outcome::Aborted(CANCELED_MESSAGE.to_string());
                break;
            }

            let step_row = StepExecutionRepository::start(&*self.db, step_row).await?;
            let position = step_row.position;

            let sink = OutputSink::new(self.config.runner.output_tail_bytes);
            let flusher = self.spawn_output_flusher(step_row.id, sink.clone());

            let step_result = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(
                        deadline,
                        runner.execute_step(&step_row, &step_spec, sink.clone(), sink.clone()),
                    )
                    .await
                    {
                        Ok(result) => Some(result),
                        // Dropping the in-flight step future tears the step
                        // down; the runner's terminate below reclaims the
                        // backend.
                        Err(_) => None,
                    }
                }
                None => Some(
                    runner
                        .execute_step(&step_row, &step_spec, sink.clone(), sink.clone())
                        .await,
                ),
            };

            flusher.abort();
            let output = sink.contents();
            if !output.is_empty() {
                StepExecutionRepository::save_output(&*self.db, step_row.id, &output).await?;
            }

            let Some(step_result) = step_result else {
                StepExecutionRepository::finish(
                    &*self.db,
                    step_row,
                    StepStatus::Aborted,
                    Some(DEADLINE_MESSAGE),
                )
                .await?;
                outcome = Outcome::Aborted(DEADLINE_MESSAGE.to_string());
                break;
            };

            match step_result {
                Ok(()) => {
                    StepExecutionRepository::finish(&*self.db, step_row, StepStatus::Successful, None)
                        .await?;
                    debug!(
                        execution_id = %execution.id,
                        position,
                        "step completed"
                    );
                }
                Err(RunnerError::StepFailure { reason }) => {
                    StepExecutionRepository::finish(
                        &*self.db,
                        step_row,
                        StepStatus::Failed,
                        Some(&reason),
                    )
                    .await?;
                    outcome = Outcome::Failed(reason);
                    break;
                }
                Err(RunnerError::Canceled) => {
                    StepExecutionRepository::finish(
                        &*self.db,
                        step_row,
                        StepStatus::Aborted,
                        Some(CANCELED_MESSAGE),
                    )
                    .await?;
                    outcome = Outcome::Aborted(CANCELED_MESSAGE.to_string());
                    break;
                }
                Err(err) => {
                    // Transport and other runner failures: the step never
                    // reported its result, which is distinct from a step
                    // failure.
                    let message = err.to_string();
                    StepExecutionRepository::finish(
                        &*self.db,
                        step_row,
                        StepStatus::Aborted,
                        Some(&message),
                    )
                    .await?;
                    outcome = Outcome::Aborted(message);
                    break;
                }
            }
        }

        runner.terminate().await;
        watcher.abort();

        self.finalize(&execution, outcome).await
    }

    /// Finalises the execution and propagates the terminal state to any
    /// steps that never ran.
    async fn finalize(
        &self,
        execution: &job_execution::Model,
        outcome: Outcome,
    ) -> Result<(), StoreError> {
        let (status, message) = match &outcome {
            Outcome::Successful => (ExecutionStatus::Successful, None),
            Outcome::Failed(message) => (ExecutionStatus::Failed, Some(message.as_str())),
            Outcome::Aborted(message) => (ExecutionStatus::Aborted, Some(message.as_str())),
        };

        if !matches!(outcome, Outcome::Successful) {
            StepExecutionRepository::abort_remaining(&*self.db, execution.id).await?;
        }

        JobExecutionRepository::finish(&*self.db, execution.id, status, message).await?;

        info!(
            execution_id = %execution.id,
            status = %status,
            "job execution finished"
        );

        Ok(())
    }

    /// Watches the execution row for an externally requested abort and
    /// cancels the driver context when one appears.
    fn spawn_abort_watcher(&self, execution_id: Uuid, cancel: CancellationToken) -> JoinHandle<()> {
        let db = self.db.clone();
        let interval = Duration::from_millis(self.config.runner.abort_poll_interval_ms);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(interval) => {
                        match JobExecutionRepository::abort_requested(&*db, execution_id).await {
                            Ok(true) => {
                                info!(execution_id = %execution_id, "abort requested");
                                cancel.cancel();
                                break;
                            }
                            Ok(false) => {}
                            Err(err) => {
                                debug!(
                                    execution_id = %execution_id,
                                    error = %err,
                                    "abort poll failed"
                                );
                            }
                        }
                    }
                }
            }
        })
    }

    /// Periodically persists the dirty output tail of a running step.
    fn spawn_output_flusher(&self, step_id: Uuid, sink: OutputSink) -> JoinHandle<()> {
        let db = self.db.clone();
        let interval = Duration::from_millis(self.config.runner.output_flush_interval_ms);

        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if let Some(tail) = sink.take_if_dirty() {
                    if let Err(err) =
                        StepExecutionRepository::save_output(&*db, step_id, &tail).await
                    {
                        warn!(step_id = %step_id, error = %err, "cannot persist step output");
                    }
                }
            }
        })
    }
}
