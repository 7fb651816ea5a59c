//! Migration to create the identities table. Credential data is sealed by
//! the crypto layer before it reaches this table; the store only ever sees
//! opaque bytes.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Identities::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Identities::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Identities::ProjectId).uuid().not_null())
                    .col(ColumnDef::new(Identities::Connector).text().not_null())
                    .col(ColumnDef::new(Identities::Kind).text().not_null())
                    .col(ColumnDef::new(Identities::Name).text().not_null())
                    .col(
                        ColumnDef::new(Identities::SealedData)
                            .binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Identities::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_identities_project_id")
                            .from(Identities::Table, Identities::ProjectId)
                            .to(Projects::Table, Projects::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_identities_project_name")
                    .table(Identities::Table)
                    .col(Identities::ProjectId)
                    .col(Identities::Name)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_identities_project_name").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Identities::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Identities {
    Table,
    Id,
    ProjectId,
    Connector,
    Kind,
    Name,
    SealedData,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Projects {
    Table,
    Id,
}
