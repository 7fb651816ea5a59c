//! Repository operations for the jobs table.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
};
use uuid::Uuid;

use crate::db::StoreError;
use crate::models::job::{ActiveModel, Column, Entity, JobSpec, Model};
use crate::scope::{apply_scope, ProjectScope};

pub struct JobRepository;

impl JobRepository {
    /// Inserts a new job from its typed specification. The concurrency limit
    /// is mirrored onto its own column for the scheduler's selection query.
    pub async fn create<C: ConnectionTrait>(
        conn: &C,
        project_id: Uuid,
        name: &str,
        spec: &JobSpec,
    ) -> Result<Model, StoreError> {
        let now = Utc::now().fixed_offset();

        let job = ActiveModel {
            id: Set(Uuid::new_v4()),
            project_id: Set(project_id),
            name: Set(name.to_string()),
            spec: Set(spec.to_value()),
            concurrency: Set(spec.concurrency as i32),
            disabled: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let model = job.insert(conn).await?;

        tracing::info!(
            job_id = %model.id,
            project_id = %project_id,
            name = %model.name,
            "job created"
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

    pub async fn load_by_name<C: ConnectionTrait>(
        conn: &C,
        scope: &ProjectScope,
        name: &str,
    ) -> Result<Option<Model>, StoreError> {
        Ok(scope
            .apply(Entity::find(), Column::ProjectId)
            .filter(Column::Name.eq(name))
            .one(conn)
            .await?)
    }

    /// Replaces a job's specification in place.
    pub async fn update_spec<C: ConnectionTrait>(
        conn: &C,
        job: Model,
        spec: &JobSpec,
    ) -> Result<Model, StoreError> {
        let mut active: ActiveModel = job.into();
        active.spec = Set(spec.to_value());
        active.concurrency = Set(spec.concurrency as i32);
        active.updated_at = Set(Utc::now().fixed_offset());
        Ok(active.update(conn).await?)
    }

    /// Soft-deletes a job. Existing executions keep their job id; the
    /// scheduler simply stops selecting new ones.
    pub async fn disable<C: ConnectionTrait>(
        conn: &C,
        id: Uuid,
        scope: Option<&ProjectScope>,
    ) -> Result<(), StoreError> {
        let Some(job) = Self::load_by_id(conn, id, scope).await? else {
            return Ok(());
        };

        let mut active: ActiveModel = job.into();
        active.disabled = Set(true);
        active.updated_at = Set(Utc::now().fixed_offset());
        active.update(conn).await?;

        tracing::info!(job_id = %id, "job disabled");

        Ok(())
    }
}
