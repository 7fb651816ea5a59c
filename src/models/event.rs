//! Event entity model.
//!
//! An event is *raw* (no subscription, audit trail only) or *bound*
//! (subscription id set). Only bound events drive job executions. Rows are
//! immutable after creation except for the processed marker.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub project_id: Uuid,

    /// Connector that emitted the event.
    pub connector: String,

    /// Event name within the connector's namespace.
    pub name: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub data: JsonValue,

    /// When the event happened at the source; falls back to creation time
    /// when the source does not carry one.
    pub event_time: DateTimeWithTimeZone,

    pub created_at: DateTimeWithTimeZone,

    pub subscription_id: Option<Uuid>,

    pub processed: bool,

    pub processed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::project::Entity",
        from = "Column::ProjectId",
        to = "super::project::Column::Id"
    )]
    Project,
    #[sea_orm(
        belongs_to = "super::subscription::Entity",
        from = "Column::SubscriptionId",
        to = "super::subscription::Column::Id"
    )]
    Subscription,
}

impl Related<super::project::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Project.def()
    }
}

impl Related<super::subscription::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Subscription.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Whether this event can drive a job execution.
    pub fn is_bound(&self) -> bool {
        self.subscription_id.is_some()
    }
}
