//! Repository operations for subscriptions and their connector sub-tables,
//! including the event→subscription matcher.

use chrono::{Duration, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseBackend, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, Statement, Value,
};
use serde_json::json;
use uuid::Uuid;

use crate::db::StoreError;
use crate::models::github_subscription::{
    ActiveModel as GithubActiveModel, REPOSITORY_WILDCARD,
};
use crate::models::subscription::{ActiveModel, Column, Entity, Model, SubscriptionStatus};
use crate::scope::{apply_scope, ProjectScope};

pub struct SubscriptionRepository;

impl SubscriptionRepository {
    /// Inserts a github subscription: the base row plus its structured
    /// routing parameters in `c_github_subscriptions`. A missing repository
    /// stores the `*` wildcard, matching the whole organization.
    pub async fn create_github<C: ConnectionTrait>(
        conn: &C,
        project_id: Uuid,
        job_id: Uuid,
        event: &str,
        organization: &str,
        repository: Option<&str>,
        identity_id: Option<Uuid>,
    ) -> Result<Model, StoreError> {
        let repository = repository.unwrap_or(REPOSITORY_WILDCARD);
        let parameters = json!({
            "organization": organization,
            "repository": repository,
        });

        let model = Self::insert_base(
            conn,
            project_id,
            job_id,
            identity_id,
            "github",
            event,
            parameters,
            None,
        )
        .await?;

        let github = GithubActiveModel {
            id: Set(model.id),
            organization: Set(organization.to_string()),
            repository: Set(repository.to_string()),
        };
        github.insert(conn).await?;

        Ok(model)
    }

    /// Inserts a periodic subscription driven by the refresher loop.
    pub async fn create_periodic<C: ConnectionTrait>(
        conn: &C,
        project_id: Uuid,
        job_id: Uuid,
        connector: &str,
        event: &str,
        update_delay_seconds: i32,
    ) -> Result<Model, StoreError> {
        let model = Self::insert_base(
            conn,
            project_id,
            job_id,
            None,
            connector,
            event,
            json!({}),
            Some(update_delay_seconds),
        )
        .await?;

        Ok(model)
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_base<C: ConnectionTrait>(
        conn: &C,
        project_id: Uuid,
        job_id: Uuid,
        identity_id: Option<Uuid>,
        connector: &str,
        event: &str,
        parameters: serde_json::Value,
        update_delay: Option<i32>,
    ) -> Result<Model, StoreError> {
        let now = Utc::now().fixed_offset();
        let next_update = update_delay.map(|_| now);

        let subscription = ActiveModel {
            id: Set(Uuid::new_v4()),
            project_id: Set(project_id),
            job_id: Set(job_id),
            identity_id: Set(identity_id),
            connector: Set(connector.to_string()),
            event: Set(event.to_string()),
            parameters: Set(parameters),
            status: Set(SubscriptionStatus::Active.as_str().to_string()),
            update_delay: Set(update_delay),
            last_update: Set(None),
            next_update: Set(next_update),
            creation_time: Set(now),
        };

        let model = subscription.insert(conn).await?;

        tracing::info!(
            subscription_id = %model.id,
            connector = %model.connector,
            event = %model.event,
            job_id = %job_id,
            "subscription created"
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

    pub async fn set_status<C: ConnectionTrait>(
        conn: &C,
        subscription: Model,
        status: SubscriptionStatus,
    ) -> Result<Model, StoreError> {
        let mut active: ActiveModel = subscription.into();
        active.status = Set(status.as_str().to_string());
        Ok(active.update(conn).await?)
    }

    /// Matcher for github events: active subscriptions for the event joined
    /// to the structured sub-table, matching the organization and either the
    /// exact repository or the `*` wildcard. Runs inside the caller's
    /// transaction.
    pub async fn match_github<C: ConnectionTrait>(
        conn: &C,
        event: &str,
        organization: &str,
        repository: Option<&str>,
    ) -> Result<Vec<Model>, StoreError> {
        let backend = conn.get_database_backend();

        let (sql, values): (&str, Vec<Value>) = match repository {
            Some(repository) => (
                match backend {
                    DatabaseBackend::Postgres => {
                        "SELECT s.* FROM subscriptions AS s \
                         JOIN c_github_subscriptions AS gs ON gs.id = s.id \
                         WHERE s.connector = 'github' AND s.event = $1 \
                           AND s.status = 'active' AND gs.organization = $2 \
                           AND (gs.repository = $3 OR gs.repository = '*') \
                         ORDER BY s.creation_time ASC, s.id ASC"
                    }
                    _ => {
                        "SELECT s.* FROM subscriptions AS s \
                         JOIN c_github_subscriptions AS gs ON gs.id = s.id \
                         WHERE s.connector = 'github' AND s.event = ? \
                           AND s.status = 'active' AND gs.organization = ? \
                           AND (gs.repository = ? OR gs.repository = '*') \
                         ORDER BY s.creation_time ASC, s.id ASC"
                    }
                },
                vec![event.into(), organization.into(), repository.into()],
            ),
            None => (
                match backend {
                    DatabaseBackend::Postgres => {
                        "SELECT s.* FROM subscriptions AS s \
                         JOIN c_github_subscriptions AS gs ON gs.id = s.id \
                         WHERE s.connector = 'github' AND s.event = $1 \
                           AND s.status = 'active' AND gs.organization = $2 \
                         ORDER BY s.creation_time ASC, s.id ASC"
                    }
                    _ => {
                        "SELECT s.* FROM subscriptions AS s \
                         JOIN c_github_subscriptions AS gs ON gs.id = s.id \
                         WHERE s.connector = 'github' AND s.event = ? \
                           AND s.status = 'active' AND gs.organization = ? \
                         ORDER BY s.creation_time ASC, s.id ASC"
                    }
                },
                vec![event.into(), organization.into()],
            ),
        };

        let subscriptions = Entity::find()
            .from_raw_sql(Statement::from_sql_and_values(backend, sql, values))
            .all(conn)
            .await?;

        Ok(subscriptions)
    }

    /// Distinct projects holding an active github subscription for the
    /// organization, regardless of event name. Used to record raw webhook
    /// deliveries per interested project.
    pub async fn github_projects_for_organization<C: ConnectionTrait>(
        conn: &C,
        organization: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        let backend = conn.get_database_backend();

        let sql = match backend {
            DatabaseBackend::Postgres => {
                "SELECT DISTINCT s.project_id FROM subscriptions AS s \
                 JOIN c_github_subscriptions AS gs ON gs.id = s.id \
                 WHERE s.connector = 'github' AND s.status = 'active' \
                   AND gs.organization = $1"
            }
            _ => {
                "SELECT DISTINCT s.project_id FROM subscriptions AS s \
                 JOIN c_github_subscriptions AS gs ON gs.id = s.id \
                 WHERE s.connector = 'github' AND s.status = 'active' \
                   AND gs.organization = ?"
            }
        };

        let rows = conn
            .query_all(Statement::from_sql_and_values(
                backend,
                sql,
                [organization.into()],
            ))
            .await?;

        let mut project_ids = Vec::with_capacity(rows.len());
        for row in rows {
            project_ids.push(row.try_get::<Uuid>("", "project_id")?);
        }

        Ok(project_ids)
    }

    /// Active periodic subscriptions that are due for a refresh, oldest
    /// first.
    pub async fn due_for_refresh<C: ConnectionTrait>(
        conn: &C,
        now: DateTimeWithTimeZone,
        limit: u64,
    ) -> Result<Vec<Model>, StoreError> {
        Ok(Entity::find()
            .filter(Column::Status.eq(SubscriptionStatus::Active.as_str()))
            .filter(Column::NextUpdate.is_not_null())
            .filter(Column::NextUpdate.lte(now))
            .order_by_asc(Column::NextUpdate)
            .limit(limit)
            .all(conn)
            .await?)
    }

    /// Advances the refresh bookkeeping of a periodic subscription after a
    /// successful refresh.
    pub async fn mark_refreshed<C: ConnectionTrait>(
        conn: &C,
        subscription: Model,
        now: DateTimeWithTimeZone,
    ) -> Result<Model, StoreError> {
        let delay = subscription.update_delay.unwrap_or(0).max(1);
        let next = now + Duration::seconds(delay as i64);

        let mut active: ActiveModel = subscription.into();
        active.last_update = Set(Some(now));
        active.next_update = Set(Some(next));
        Ok(active.update(conn).await?)
    }
}
