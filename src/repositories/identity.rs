//! Repository operations for identities. Credential data is sealed on the
//! way in and unsealed on the way out; rows only ever hold opaque bytes.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::crypto::{self, CryptoError, IdentityKey};
use crate::db::StoreError;
use crate::models::identity::{ActiveModel, Column, Entity, Model};
use crate::scope::{apply_scope, ProjectScope};

/// Identity failures combine store and sealing errors.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub struct IdentityRepository;

impl IdentityRepository {
    /// Seals and stores credential data for a connector identity kind.
    pub async fn create<C: ConnectionTrait>(
        conn: &C,
        key: &IdentityKey,
        scope: &ProjectScope,
        connector: &str,
        kind: &str,
        name: &str,
        data: &JsonValue,
    ) -> Result<Model, IdentityError> {
        let sealed =
            crypto::seal_identity_data(key, scope.project_id(), connector, kind, data)?;

        let identity = ActiveModel {
            id: Set(Uuid::new_v4()),
            project_id: Set(scope.project_id()),
            connector: Set(connector.to_string()),
            kind: Set(kind.to_string()),
            name: Set(name.to_string()),
            sealed_data: Set(sealed),
            created_at: Set(Utc::now().fixed_offset()),
        };

        let model = identity.insert(conn).await.map_err(StoreError::from)?;

        tracing::info!(
            identity_id = %model.id,
            connector = %connector,
            kind = %kind,
            "identity created"
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

    /// Unseals the credential data of a loaded identity.
    pub fn unseal(key: &IdentityKey, identity: &Model) -> Result<JsonValue, CryptoError> {
        crypto::unseal_identity_data(
            key,
            identity.project_id,
            &identity.connector,
            &identity.kind,
            &identity.sealed_data,
        )
    }
}
