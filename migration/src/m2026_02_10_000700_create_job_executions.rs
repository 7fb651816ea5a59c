//! Migration to create the job_executions table, the unit of work claimed by
//! the scheduler.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JobExecutions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobExecutions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(JobExecutions::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(JobExecutions::JobId).uuid().not_null())
                    .col(ColumnDef::new(JobExecutions::EventId).uuid().null())
                    .col(
                        ColumnDef::new(JobExecutions::Status)
                            .text()
                            .not_null()
                            .default("created"),
                    )
                    .col(
                        ColumnDef::new(JobExecutions::ScheduledAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(JobExecutions::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(JobExecutions::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(JobExecutions::StepCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(JobExecutions::RunnerData).json_binary().null())
                    .col(ColumnDef::new(JobExecutions::FailureMessage).text().null())
                    .col(
                        ColumnDef::new(JobExecutions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(JobExecutions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_job_executions_project_id")
                            .from(JobExecutions::Table, JobExecutions::ProjectId)
                            .to(Projects::Table, Projects::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_job_executions_job_id")
                            .from(JobExecutions::Table, JobExecutions::JobId)
                            .to(Jobs::Table, Jobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Scheduler selection: next created execution in (scheduled_at, id)
        // order.
        manager
            .create_index(
                Index::create()
                    .name("idx_job_executions_status_scheduled")
                    .table(JobExecutions::Table)
                    .col(JobExecutions::Status)
                    .col(JobExecutions::ScheduledAt)
                    .to_owned(),
            )
            .await?;

        // In-flight count per job for the concurrency gate.
        manager
            .create_index(
                Index::create()
                    .name("idx_job_executions_job_status")
                    .table(JobExecutions::Table)
                    .col(JobExecutions::JobId)
                    .col(JobExecutions::Status)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_job_executions_status_scheduled")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_job_executions_job_status").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(JobExecutions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum JobExecutions {
    Table,
    Id,
    ProjectId,
    JobId,
    EventId,
    Status,
    ScheduledAt,
    StartedAt,
    FinishedAt,
    StepCount,
    RunnerData,
    FailureMessage,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Projects {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
}
