//! Repository operations for the step_executions table.

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

use crate::db::StoreError;
use crate::models::job_execution;
use crate::models::step_execution::{ActiveModel, Column, Entity, Model, StepStatus};

pub struct StepExecutionRepository;

impl StepExecutionRepository {
    /// Creates the step rows of a freshly materialised execution, positions
    /// 1..=n in `created` state.
    pub async fn create_for_execution<C: ConnectionTrait>(
        conn: &C,
        execution: &job_execution::Model,
        step_count: usize,
    ) -> Result<Vec<Model>, StoreError> {
        let mut steps = Vec::with_capacity(step_count);

        for position in 1..=step_count {
            let step = ActiveModel {
                id: Set(Uuid::new_v4()),
                project_id: Set(execution.project_id),
                job_execution_id: Set(execution.id),
                position: Set(position as i32),
                status: Set(StepStatus::Created.as_str().to_string()),
                started_at: Set(None),
                finished_at: Set(None),
                output: Set(None),
                failure_message: Set(None),
            };
            steps.push(step.insert(conn).await?);
        }

        Ok(steps)
    }

    /// Steps of an execution in position order.
    pub async fn load_for_execution<C: ConnectionTrait>(
        conn: &C,
        job_execution_id: Uuid,
    ) -> Result<Vec<Model>, StoreError> {
        Ok(Entity::find()
            .filter(Column::JobExecutionId.eq(job_execution_id))
            .order_by_asc(Column::Position)
            .all(conn)
            .await?)
    }

    /// Transitions `created → started`.
    pub async fn start<C: ConnectionTrait>(conn: &C, step: Model) -> Result<Model, StoreError> {
        let mut active: ActiveModel = step.into();
        active.status = Set(StepStatus::Started.as_str().to_string());
        active.started_at = Set(Some(Utc::now().fixed_offset()));
        Ok(active.update(conn).await?)
    }

    /// Finalises a step into a terminal status.
    pub async fn finish<C: ConnectionTrait>(
        conn: &C,
        step: Model,
        status: StepStatus,
        failure_message: Option<&str>,
    ) -> Result<Model, StoreError> {
        debug_assert!(status.is_terminal());

        let mut active: ActiveModel = step.into();
        active.status = Set(status.as_str().to_string());
        active.finished_at = Set(Some(Utc::now().fixed_offset()));
        active.failure_message = Set(failure_message.map(|m| m.to_string()));
        Ok(active.update(conn).await?)
    }

    /// Persists the current output tail of a running step.
    pub async fn save_output<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        output: &str,
    ) -> Result<(), StoreError> {
        Entity::update_many()
            .col_expr(Column::Output, Expr::value(output))
            .filter(Column::Id.eq(id))
            .exec(conn)
            .await?;
        Ok(())
    }

    /// Aborts every non-terminal step of an execution; used both when a
    /// failure skips the remaining steps and when the parent finalises so a
    /// terminal parent never leaves non-terminal children behind.
    pub async fn abort_remaining<C: ConnectionTrait>(
        conn: &C,
        job_execution_id: Uuid,
    ) -> Result<u64, StoreError> {
        let now = Utc::now().fixed_offset();

        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(StepStatus::Aborted.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(now))
            .filter(Column::JobExecutionId.eq(job_execution_id))
            .filter(Column::Status.is_in([
                StepStatus::Created.as_str(),
                StepStatus::Started.as_str(),
            ]))
            .exec(conn)
            .await?;

        Ok(result.rows_affected)
    }
}
