//! Migration to create the subscriptions table, linking an event pattern to
//! a job. Connector-specific routing parameters live in sub-tables joined on
//! the subscription id.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Subscriptions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Subscriptions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Subscriptions::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(Subscriptions::JobId).uuid().not_null())
                    .col(ColumnDef::new(Subscriptions::IdentityId).uuid().null())
                    .col(ColumnDef::new(Subscriptions::Connector).text().not_null())
                    .col(ColumnDef::new(Subscriptions::Event).text().not_null())
                    .col(
                        ColumnDef::new(Subscriptions::Parameters)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Subscriptions::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(Subscriptions::UpdateDelay)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Subscriptions::LastUpdate)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Subscriptions::NextUpdate)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Subscriptions::CreationTime)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_subscriptions_project_id")
                            .from(Subscriptions::Table, Subscriptions::ProjectId)
                            .to(Projects::Table, Projects::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_subscriptions_job_id")
                            .from(Subscriptions::Table, Subscriptions::JobId)
                            .to(Jobs::Table, Jobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Matcher entry point: active subscriptions for a connector event.
        manager
            .create_index(
                Index::create()
                    .name("idx_subscriptions_connector_event_status")
                    .table(Subscriptions::Table)
                    .col(Subscriptions::Connector)
                    .col(Subscriptions::Event)
                    .col(Subscriptions::Status)
                    .to_owned(),
            )
            .await?;

        // Refresher entry point: periodic subscriptions that are due.
        manager
            .create_index(
                Index::create()
                    .name("idx_subscriptions_next_update")
                    .table(Subscriptions::Table)
                    .col(Subscriptions::Status)
                    .col(Subscriptions::NextUpdate)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_subscriptions_connector_event_status")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_subscriptions_next_update").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Subscriptions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Subscriptions {
    Table,
    Id,
    ProjectId,
    JobId,
    IdentityId,
    Connector,
    Event,
    Parameters,
    Status,
    UpdateDelay,
    LastUpdate,
    NextUpdate,
    CreationTime,
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
