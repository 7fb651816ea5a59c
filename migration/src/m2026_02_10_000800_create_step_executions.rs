//! Migration to create the step_executions table, ordered by position within
//! their parent job execution.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(StepExecutions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(StepExecutions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(StepExecutions::ProjectId).uuid().not_null())
                    .col(
                        ColumnDef::new(StepExecutions::JobExecutionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(StepExecutions::Position)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(StepExecutions::Status)
                            .text()
                            .not_null()
                            .default("created"),
                    )
                    .col(
                        ColumnDef::new(StepExecutions::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(StepExecutions::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(StepExecutions::Output).text().null())
                    .col(
                        ColumnDef::new(StepExecutions::FailureMessage)
                            .text()
                            .null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_step_executions_project_id")
                            .from(StepExecutions::Table, StepExecutions::ProjectId)
                            .to(Projects::Table, Projects::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_step_executions_job_execution_id")
                            .from(StepExecutions::Table, StepExecutions::JobExecutionId)
                            .to(JobExecutions::Table, JobExecutions::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_step_executions_execution_position")
                    .table(StepExecutions::Table)
                    .col(StepExecutions::JobExecutionId)
                    .col(StepExecutions::Position)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_step_executions_execution_position")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(StepExecutions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum StepExecutions {
    Table,
    Id,
    ProjectId,
    JobExecutionId,
    Position,
    Status,
    StartedAt,
    FinishedAt,
    Output,
    FailureMessage,
}

#[derive(DeriveIden)]
enum Projects {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum JobExecutions {
    Table,
    Id,
}
