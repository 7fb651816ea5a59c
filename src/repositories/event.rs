//! Repository operations for the events table.

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::db::StoreError;
use crate::models::event::{ActiveModel, Column, Entity, Model};
use crate::models::subscription;
use crate::scope::{apply_scope, ProjectScope};

pub struct EventRepository;

impl EventRepository {
    /// Inserts a raw, unbound event. Raw events are an audit trail; they are
    /// never consumed by the event processor.
    pub async fn insert_raw<C: ConnectionTrait>(
        conn: &C,
        project_id: Uuid,
        connector: &str,
        name: &str,
        data: JsonValue,
        event_time: Option<DateTimeWithTimeZone>,
    ) -> Result<Model, StoreError> {
        let now = Utc::now().fixed_offset();

        let event = ActiveModel {
            id: Set(Uuid::new_v4()),
            project_id: Set(project_id),
            connector: Set(connector.to_string()),
            name: Set(name.to_string()),
            data: Set(data),
            event_time: Set(event_time.unwrap_or(now)),
            created_at: Set(now),
            subscription_id: Set(None),
            processed: Set(false),
            processed_at: Set(None),
        };

        Ok(event.insert(conn).await?)
    }

    /// Inserts an event bound to a subscription. Bound events are what the
    /// event processor turns into job executions.
    pub async fn insert_bound<C: ConnectionTrait>(
        conn: &C,
        subscription: &subscription::Model,
        name: &str,
        data: JsonValue,
        event_time: Option<DateTimeWithTimeZone>,
    ) -> Result<Model, StoreError> {
        let now = Utc::now().fixed_offset();

        let event = ActiveModel {
            id: Set(Uuid::new_v4()),
            project_id: Set(subscription.project_id),
            connector: Set(subscription.connector.clone()),
            name: Set(name.to_string()),
            data: Set(data),
            event_time: Set(event_time.unwrap_or(now)),
            created_at: Set(now),
            subscription_id: Set(Some(subscription.id)),
            processed: Set(false),
            processed_at: Set(None),
        };

        let model = event.insert(conn).await?;

        tracing::debug!(
            event_id = %model.id,
            subscription_id = %subscription.id,
            name = %model.name,
            "bound event created"
        );

        Ok(model)
    }

    pub async fn load_by_id<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        scope: Option<&ProjectScope>,
    ) -> Result<Option<Model>, StoreError> {
        let select = apply_scope(Entity::find_by_id(id), scope, Column::ProjectId);
        Ok(select.one(conn).await?)
    }

    /// The oldest unprocessed bound event, if any. Raw events are skipped by
    /// construction.
    pub async fn next_unprocessed<C: ConnectionTrait>(
        conn: &C,
    ) -> Result<Option<Model>, StoreError> {
        Ok(Entity::find()
            .filter(Column::Processed.eq(false))
            .filter(Column::SubscriptionId.is_not_null())
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .one(conn)
            .await?)
    }

    pub async fn mark_processed<C: ConnectionTrait>(
        conn: &C,
        event: Model,
    ) -> Result<Model, StoreError> {
        let mut active: ActiveModel = event.into();
        active.processed = Set(true);
        active.processed_at = Set(Some(Utc::now().fixed_offset()));
        Ok(active.update(conn).await?)
    }
}
