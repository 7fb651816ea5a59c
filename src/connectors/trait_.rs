//! Connector trait definition
//!
//! Defines the lifecycle and capabilities every connector implementation
//! must honor.

use async_trait::async_trait;
use axum::http::HeaderMap;
use sea_orm::{DatabaseConnection, DatabaseTransaction};
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;

use crate::db::StoreError;
use crate::models::subscription;

/// Errors produced by connector operations.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("connector '{0}' does not support webhooks")]
    WebhookNotSupported(String),
    #[error("connector '{0}' is not configured")]
    NotConfigured(String),
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("invalid webhook event: {0}")]
    InvalidWebhookEvent(String),
    #[error("invalid identity data: {0}")]
    InvalidIdentityData(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sea_orm::DbErr> for ConnectorError {
    fn from(err: sea_orm::DbErr) -> Self {
        ConnectorError::Store(StoreError::from_db_err(err))
    }
}

/// Wiring handed to connectors at worker start.
#[derive(Debug, Clone)]
pub struct ConnectorInitData {
    /// Public base URI from which webhook endpoints are derived.
    pub web_base_uri: Url,
}

/// Static description of a connector: its name and the identity kinds it
/// accepts, declared at construction.
#[derive(Debug, Clone)]
pub struct ConnectorDef {
    pub name: &'static str,
    pub identities: Vec<IdentityDef>,
}

impl ConnectorDef {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            identities: Vec::new(),
        }
    }

    pub fn with_identity(mut self, identity: IdentityDef) -> Self {
        self.identities.push(identity);
        self
    }

    pub fn identity(&self, kind: &str) -> Option<&IdentityDef> {
        self.identities.iter().find(|def| def.kind == kind)
    }
}

/// An identity kind and the fields its data must carry.
#[derive(Debug, Clone)]
pub struct IdentityDef {
    pub kind: &'static str,
    pub fields: Vec<IdentityField>,
}

#[derive(Debug, Clone)]
pub struct IdentityField {
    pub name: &'static str,
    pub required: bool,
    pub secret: bool,
}

impl IdentityDef {
    pub fn new(kind: &'static str, fields: Vec<IdentityField>) -> Self {
        Self { kind, fields }
    }

    /// Validates identity data against the declared fields before it is
    /// sealed for storage.
    pub fn validate(&self, data: &JsonValue) -> Result<(), ConnectorError> {
        let object = data.as_object().ok_or_else(|| {
            ConnectorError::InvalidIdentityData("identity data must be an object".to_string())
        })?;

        for field in &self.fields {
            match object.get(field.name) {
                Some(JsonValue::String(value)) if !value.is_empty() => {}
                Some(JsonValue::String(_)) | None if !field.required => {}
                None => {
                    return Err(ConnectorError::InvalidIdentityData(format!(
                        "missing field '{}'",
                        field.name
                    )));
                }
                _ => {
                    return Err(ConnectorError::InvalidIdentityData(format!(
                        "field '{}' must be a non-empty string",
                        field.name
                    )));
                }
            }
        }

        for key in object.keys() {
            if !self.fields.iter().any(|field| field.name == key) {
                return Err(ConnectorError::InvalidIdentityData(format!(
                    "unknown field '{key}'"
                )));
            }
        }

        Ok(())
    }
}

impl IdentityField {
    pub fn required(name: &'static str) -> Self {
        Self {
            name,
            required: true,
            secret: false,
        }
    }

    pub fn optional(name: &'static str) -> Self {
        Self {
            name,
            required: false,
            secret: false,
        }
    }

    pub fn secret(name: &'static str) -> Self {
        Self {
            name,
            required: true,
            secret: true,
        }
    }

    pub fn optional_secret(name: &'static str) -> Self {
        Self {
            name,
            required: false,
            secret: true,
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &'static str;

    fn definition(&self) -> &ConnectorDef;

    /// Wire logger, base URI and friends. Called once at worker start.
    async fn init(&self, _init_data: &ConnectorInitData) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Flush and release. Called once at worker shutdown.
    async fn terminate(&self) {}

    /// Handle an incoming webhook delivery for the given target, creating
    /// durable events inside a single transaction. Connectors without a
    /// webhook surface keep the default.
    async fn process_webhook(
        &self,
        _db: &DatabaseConnection,
        _target: &str,
        _headers: &HeaderMap,
        _body: &[u8],
    ) -> Result<(), ConnectorError> {
        Err(ConnectorError::WebhookNotSupported(self.name().to_string()))
    }

    /// Periodic ingress hook driven by the subscription refresher for
    /// subscriptions carrying an update delay. Runs inside the refresher's
    /// transaction.
    async fn refresh_subscription(
        &self,
        _txn: &DatabaseTransaction,
        _subscription: &subscription::Model,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }
}
