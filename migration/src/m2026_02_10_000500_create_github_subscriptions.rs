//! Migration to create the c_github_subscriptions sub-table holding the
//! structured routing parameters of github subscriptions. A repository value
//! of `*` matches every repository in the organization.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(GithubSubscriptions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(GithubSubscriptions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(GithubSubscriptions::Organization)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(GithubSubscriptions::Repository)
                            .text()
                            .not_null()
                            .default("*"),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_c_github_subscriptions_id")
                            .from(GithubSubscriptions::Table, GithubSubscriptions::Id)
                            .to(Subscriptions::Table, Subscriptions::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_c_github_subscriptions_org_repo")
                    .table(GithubSubscriptions::Table)
                    .col(GithubSubscriptions::Organization)
                    .col(GithubSubscriptions::Repository)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_c_github_subscriptions_org_repo")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(GithubSubscriptions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum GithubSubscriptions {
    #[sea_orm(iden = "c_github_subscriptions")]
    Table,
    Id,
    Organization,
    Repository,
}

#[derive(DeriveIden)]
enum Subscriptions {
    Table,
    Id,
}
