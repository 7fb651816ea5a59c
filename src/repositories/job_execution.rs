//! Repository operations for the job_executions table, including the
//! scheduler's selection query and the status-guarded transitions that keep
//! the state machine monotonic under concurrent workers.

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseBackend, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set, Statement,
};
use uuid::Uuid;

use crate::db::StoreError;
use crate::models::job_execution::{ActiveModel, Column, Entity, ExecutionStatus, Model};
use crate::scope::{apply_scope, ProjectScope};

pub struct JobExecutionRepository;

impl JobExecutionRepository {
    /// Materialises a new execution in the `created` state.
    pub async fn create<C: ConnectionTrait>(
        conn: &C,
        project_id: Uuid,
        job_id: Uuid,
        event_id: Option<Uuid>,
        scheduled_at: DateTimeWithTimeZone,
        step_count: i32,
    ) -> Result<Model, StoreError> {
        let now = Utc::now().fixed_offset();

        let execution = ActiveModel {
            id: Set(Uuid::new_v4()),
            project_id: Set(project_id),
            job_id: Set(job_id),
            event_id: Set(event_id),
            status: Set(ExecutionStatus::Created.as_str().to_string()),
            scheduled_at: Set(scheduled_at),
            started_at: Set(None),
            finished_at: Set(None),
            step_count: Set(step_count),
            runner_data: Set(None),
            failure_message: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Ok(execution.insert(conn).await?)
    }

    pub async fn load_by_id<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        scope: Option<&ProjectScope>,
    ) -> Result<Option<Model>, StoreError> {
        let select = apply_scope(Entity::find_by_id(id), scope, Column::ProjectId);
        Ok(select.one(conn).await?)
    }

    /// Selects the next schedulable execution: the oldest `created` row
    /// whose `scheduled_at` has passed, skipping disabled jobs and jobs
    /// whose in-flight limit is exhausted. Total order is
    /// `(scheduled_at, id)`. Callers hold the scheduling advisory lock.
    pub async fn load_for_scheduling<C: ConnectionTrait>(
        conn: &C,
        now: DateTimeWithTimeZone,
    ) -> Result<Option<Model>, StoreError> {
        let backend = conn.get_database_backend();

        let sql = match backend {
            DatabaseBackend::Postgres => {
                "SELECT je.* FROM job_executions AS je \
                 JOIN jobs AS j ON j.id = je.job_id \
                 WHERE je.status = 'created' AND je.scheduled_at <= $1 \
                   AND j.disabled = FALSE \
                   AND (j.concurrency = 0 OR \
                        (SELECT COUNT(*) FROM job_executions AS r \
                          WHERE r.job_id = je.job_id \
                            AND r.status IN ('started', 'abort_requested')) < j.concurrency) \
                 ORDER BY je.scheduled_at ASC, je.id ASC \
                 LIMIT 1"
            }
            _ => {
                "SELECT je.* FROM job_executions AS je \
                 JOIN jobs AS j ON j.id = je.job_id \
                 WHERE je.status = 'created' AND je.scheduled_at <= ? \
                   AND j.disabled = FALSE \
                   AND (j.concurrency = 0 OR \
                        (SELECT COUNT(*) FROM job_executions AS r \
                          WHERE r.job_id = je.job_id \
                            AND r.status IN ('started', 'abort_requested')) < j.concurrency) \
                 ORDER BY je.scheduled_at ASC, je.id ASC \
                 LIMIT 1"
            }
        };

        let execution = Entity::find()
            .from_raw_sql(Statement::from_sql_and_values(backend, sql, [now.into()]))
            .one(conn)
            .await?;

        Ok(execution)
    }

    /// Transitions `created → started`. Returns false when another worker
    /// already claimed the row, which callers treat as a clean no-op.
    pub async fn start<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        now: DateTimeWithTimeZone,
    ) -> Result<bool, StoreError> {
        let result = Entity::update_many()
            .col_expr(
                Column::Status,
                Expr::value(ExecutionStatus::Started.as_str()),
            )
            .col_expr(Column::StartedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(ExecutionStatus::Created.as_str()))
            .exec(conn)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Requests cancellation of a running execution. The owning driver
    /// observes the transition and cancels its context.
    pub async fn request_abort<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        scope: Option<&ProjectScope>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().fixed_offset();

        let mut update = Entity::update_many()
            .col_expr(
                Column::Status,
                Expr::value(ExecutionStatus::AbortRequested.as_str()),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(ExecutionStatus::Started.as_str()));

        if let Some(scope) = scope {
            update = update.filter(Column::ProjectId.eq(scope.project_id()));
        }

        let result = update.exec(conn).await?;
        Ok(result.rows_affected == 1)
    }

    /// Finalises an execution into a terminal status, guarded so terminal
    /// rows are never rewritten.
    pub async fn finish<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        status: ExecutionStatus,
        failure_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        debug_assert!(status.is_terminal());
        let now = Utc::now().fixed_offset();

        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(now))
            .col_expr(Column::FailureMessage, Expr::value(failure_message))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.is_in([
                ExecutionStatus::Created.as_str(),
                ExecutionStatus::Started.as_str(),
                ExecutionStatus::AbortRequested.as_str(),
            ]))
            .exec(conn)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Persists opaque runner backend state.
    pub async fn save_runner_data<C: ConnectionTrait>(
        conn: &C,
        execution: Model,
        runner_data: serde_json::Value,
    ) -> Result<Model, StoreError> {
        let mut active: ActiveModel = execution.into();
        active.runner_data = Set(Some(runner_data));
        active.updated_at = Set(Utc::now().fixed_offset());
        Ok(active.update(conn).await?)
    }

    /// Whether an abort has been requested for the execution.
    pub async fn abort_requested<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
    ) -> Result<bool, StoreError> {
        let count = Entity::find()
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(ExecutionStatus::AbortRequested.as_str()))
            .count(conn)
            .await?;
        Ok(count > 0)
    }

    /// Executions of a job ordered by scheduling time, newest last.
    pub async fn list_for_job<C: ConnectionTrait>(
        conn: &C,
        job_id: Uuid,
        scope: Option<&ProjectScope>,
    ) -> Result<Vec<Model>, StoreError> {
        let select = apply_scope(
            Entity::find().filter(Column::JobId.eq(job_id)),
            scope,
            Column::ProjectId,
        );
        Ok(select
            .order_by_asc(Column::ScheduledAt)
            .order_by_asc(Column::Id)
            .all(conn)
            .await?)
    }
}
