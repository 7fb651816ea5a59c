//! Structured routing parameters of github subscriptions.
//!
//! Joined to the base subscriptions table on id by the matcher. A repository
//! value of `*` matches every repository of the organization.

use sea_orm::entity::prelude::*;
use uuid::Uuid;

/// Repository value matching any repository.
pub const REPOSITORY_WILDCARD: &str = "*";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "c_github_subscriptions")]
pub struct Model {
    /// Subscription id; primary key and foreign key at once.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub organization: String,

    pub repository: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::subscription::Entity",
        from = "Column::Id",
        to = "super::subscription::Column::Id"
    )]
    Subscription,
}

impl Related<super::subscription::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Subscription.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
