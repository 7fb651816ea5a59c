//! Identity storage tests: sealing, scoping, and connector validation.

#[path = "test_utils/mod.rs"]
mod test_utils;

use anyhow::Result;
use sea_orm::EntityTrait;
use serde_json::json;
use uuid::Uuid;

use jobline::connectors::{Connector, GenericConnector};
use jobline::crypto::IdentityKey;
use jobline::models::identity;
use jobline::repositories::IdentityRepository;
use jobline::scope::ProjectScope;

use test_utils::{create_project, setup_test_db};

fn identity_key() -> IdentityKey {
    IdentityKey::new(vec![42u8; 32]).unwrap()
}

#[tokio::test]
async fn identity_data_is_sealed_at_rest_and_unseals_on_load() -> Result<()> {
    let db = setup_test_db().await?;
    let project_id = create_project(&db).await?;
    let scope = ProjectScope::new(project_id);
    let key = identity_key();

    let data = json!({"user": "deploy", "password": "hunter2"});

    let connector = GenericConnector::new();
    connector
        .definition()
        .identity("password")
        .unwrap()
        .validate(&data)?;

    let created =
        IdentityRepository::create(&db, &key, &scope, "generic", "password", "deploy-creds", &data)
            .await?;

    // The stored bytes must not leak the plaintext.
    let stored = identity::Entity::find_by_id(created.id).one(&db).await?.unwrap();
    let stored_text = String::from_utf8_lossy(&stored.sealed_data);
    assert!(!stored_text.contains("hunter2"));

    let unsealed = IdentityRepository::unseal(&key, &stored)?;
    assert_eq!(unsealed, data);

    Ok(())
}

#[tokio::test]
async fn scoped_load_refuses_foreign_projects() -> Result<()> {
    let db = setup_test_db().await?;
    let project_id = create_project(&db).await?;
    let other_project_id = create_project(&db).await?;
    let scope = ProjectScope::new(project_id);
    let key = identity_key();

    let created = IdentityRepository::create(
        &db,
        &key,
        &scope,
        "generic",
        "api_key",
        "ci-key",
        &json!({"key": "sk-123"}),
    )
    .await?;

    let other_scope = ProjectScope::new(other_project_id);
    let denied = IdentityRepository::load_by_id(&db, created.id, Some(&other_scope)).await?;
    assert!(denied.is_none());

    let allowed = IdentityRepository::load_by_id(&db, created.id, Some(&scope)).await?;
    assert!(allowed.is_some());

    // The privileged, scopeless path still sees the row.
    let admin = IdentityRepository::load_by_id(&db, created.id, None).await?;
    assert!(admin.is_some());

    Ok(())
}

#[tokio::test]
async fn unsealing_with_the_wrong_key_fails() -> Result<()> {
    let db = setup_test_db().await?;
    let project_id = create_project(&db).await?;
    let scope = ProjectScope::new(project_id);
    let key = identity_key();

    let created = IdentityRepository::create(
        &db,
        &key,
        &scope,
        "generic",
        "api_key",
        "ci-key",
        &json!({"key": "sk-123"}),
    )
    .await?;

    let wrong_key = IdentityKey::new(vec![7u8; 32]).unwrap();
    assert!(IdentityRepository::unseal(&wrong_key, &created).is_err());

    Ok(())
}

#[tokio::test]
async fn load_by_name_is_scope_bound() -> Result<()> {
    let db = setup_test_db().await?;
    let project_id = create_project(&db).await?;
    let scope = ProjectScope::new(project_id);
    let key = identity_key();

    IdentityRepository::create(
        &db,
        &key,
        &scope,
        "generic",
        "api_key",
        "registry-token",
        &json!({"key": "sk-456"}),
    )
    .await?;

    let found = IdentityRepository::load_by_name(&db, &scope, "registry-token").await?;
    assert!(found.is_some());

    let other_scope = ProjectScope::new(Uuid::new_v4());
    let missing = IdentityRepository::load_by_name(&db, &other_scope, "registry-token").await?;
    assert!(missing.is_none());

    Ok(())
}
