//! GitHub connector: webhook ingress with HMAC-authenticated deliveries.
//!
//! Every subscription target gets a deterministic secret derived from the
//! connector webhook key, so signature verification never needs a database
//! lookup. A valid delivery always records a raw event; payload
//! introspection then produces typed events fanned out to matching
//! subscriptions, all inside one transaction.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, FixedOffset};
use hmac::{Hmac, Mac};
use sea_orm::{DatabaseConnection, TransactionTrait};
use serde_json::{json, Value as JsonValue};
use sha2::Sha256;
use tracing::{debug, info};
use url::Url;

use crate::connectors::trait_::{
    Connector, ConnectorDef, ConnectorError, ConnectorInitData, IdentityDef, IdentityField,
};
use crate::db::StoreError;
use crate::repositories::{EventRepository, SubscriptionRepository};

type HmacSha256 = Hmac<Sha256>;

/// Signature header sent with each delivery.
const SIGNATURE_HEADER: &str = "x-hub-signature-256";
/// Unique id assigned by the provider to each delivery.
const DELIVERY_HEADER: &str = "x-github-delivery";
/// Provider event type of the delivery payload.
const EVENT_TYPE_HEADER: &str = "x-github-event";

pub struct GithubConnector {
    def: ConnectorDef,
    webhook_key: String,
    web_base_uri: Url,
}

impl GithubConnector {
    pub fn new(webhook_key: String, web_base_uri: Url) -> Self {
        let def = ConnectorDef::new("github").with_identity(IdentityDef::new(
            "token",
            vec![IdentityField::secret("token")],
        ));

        Self {
            def,
            webhook_key,
            web_base_uri,
        }
    }

    /// Webhook endpoint for a subscription target, handed to the provider
    /// when the hook is installed.
    pub fn webhook_uri(&self, target: &str) -> Result<Url, ConnectorError> {
        let mut uri = self.web_base_uri.clone();
        uri.path_segments_mut()
            .map_err(|_| {
                ConnectorError::InvalidWebhookEvent("web base URI cannot be a base".to_string())
            })?
            .extend(["ext", "connectors", "github", "hooks", target]);
        Ok(uri)
    }

    /// Deterministic per-target webhook secret, derivable without a
    /// database lookup.
    pub fn webhook_secret(&self, target: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.webhook_key.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(target.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verifies the delivery signature: HMAC-SHA256 over the raw body keyed
    /// by the per-target secret, compared in constant time against the
    /// `sha256=<hex>` header value.
    pub fn verify_signature(
        secret: &str,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> Result<(), ConnectorError> {
        let header = signature_header.ok_or(ConnectorError::InvalidSignature)?;

        let provided_hex = header
            .strip_prefix("sha256=")
            .ok_or(ConnectorError::InvalidSignature)?;
        let provided =
            hex::decode(provided_hex).map_err(|_| ConnectorError::InvalidSignature)?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(body);
        let expected = mac.finalize().into_bytes();

        let expected_bytes: &[u8] = expected.as_ref();
        if subtle::ConstantTimeEq::ct_eq(expected_bytes, &provided[..]).into() {
            Ok(())
        } else {
            Err(ConnectorError::InvalidSignature)
        }
    }
}

#[async_trait]
impl Connector for GithubConnector {
    fn name(&self) -> &'static str {
        "github"
    }

    fn definition(&self) -> &ConnectorDef {
        &self.def
    }

    async fn init(&self, _init_data: &ConnectorInitData) -> Result<(), ConnectorError> {
        if self.webhook_key.is_empty() {
            return Err(ConnectorError::NotConfigured("github".to_string()));
        }
        Ok(())
    }

    async fn process_webhook(
        &self,
        db: &DatabaseConnection,
        target: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<(), ConnectorError> {
        let hook_target = WebhookTarget::parse(target)?;

        let secret = self.webhook_secret(target);
        let signature = header_str(headers, SIGNATURE_HEADER);
        Self::verify_signature(&secret, signature, body)?;

        let payload: JsonValue = serde_json::from_slice(body).map_err(|err| {
            ConnectorError::InvalidWebhookEvent(format!("cannot decode payload: {err}"))
        })?;

        let delivery_id = header_str(headers, DELIVERY_HEADER).unwrap_or("").to_string();
        let event_type = header_str(headers, EVENT_TYPE_HEADER)
            .ok_or_else(|| {
                ConnectorError::InvalidWebhookEvent("missing event type header".to_string())
            })?
            .to_string();

        let typed = extract_typed_event(&event_type, &payload)?;

        let txn = db.begin().await.map_err(StoreError::from)?;

        // Raw deliveries are recorded for every project interested in the
        // organization, whether or not a typed event matches.
        let raw_data = json!({
            "delivery_id": &delivery_id,
            "event_type": &event_type,
            "event": &payload,
        });

        let projects = SubscriptionRepository::github_projects_for_organization(
            &txn,
            &hook_target.organization,
        )
        .await?;

        for project_id in &projects {
            EventRepository::insert_raw(&txn, *project_id, "github", "raw", raw_data.clone(), None)
                .await?;
        }

        if let Some(typed) = typed {
            let subscriptions = SubscriptionRepository::match_github(
                &txn,
                typed.name,
                &typed.organization,
                typed.repository.as_deref(),
            )
            .await?;

            for subscription in &subscriptions {
                EventRepository::insert_bound(
                    &txn,
                    subscription,
                    typed.name,
                    typed.data.clone(),
                    typed.event_time,
                )
                .await?;
            }

            info!(
                hook_target = %target,
                event = typed.name,
                matched = subscriptions.len(),
                "webhook delivery accepted"
            );
        } else {
            debug!(
                hook_target = %target,
                event_type = %event_type,
                "webhook delivery recorded without typed event"
            );
        }

        txn.commit().await.map_err(StoreError::from)?;

        Ok(())
    }
}

/// Parsed webhook target: `org` or `org/repo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookTarget {
    pub organization: String,
    pub repository: Option<String>,
}

impl WebhookTarget {
    pub fn parse(target: &str) -> Result<Self, ConnectorError> {
        let mut parts = target.splitn(2, '/');
        let organization = parts.next().unwrap_or("");
        let repository = parts.next();

        if organization.is_empty() {
            return Err(ConnectorError::InvalidWebhookEvent(format!(
                "invalid target '{target}'"
            )));
        }

        if let Some(repository) = repository {
            if repository.is_empty() || repository.contains('/') {
                return Err(ConnectorError::InvalidWebhookEvent(format!(
                    "invalid target '{target}'"
                )));
            }
        }

        Ok(Self {
            organization: organization.to_string(),
            repository: repository.map(|r| r.to_string()),
        })
    }

    pub fn as_string(&self) -> String {
        match &self.repository {
            Some(repository) => format!("{}/{}", self.organization, repository),
            None => self.organization.clone(),
        }
    }
}

/// A typed event extracted from a delivery payload.
#[derive(Debug, Clone)]
struct TypedEvent {
    name: &'static str,
    organization: String,
    repository: Option<String>,
    event_time: Option<DateTime<FixedOffset>>,
    data: JsonValue,
}

fn extract_typed_event(
    event_type: &str,
    payload: &JsonValue,
) -> Result<Option<TypedEvent>, ConnectorError> {
    match event_type {
        "repository" => extract_repository_event(payload),
        "push" => extract_push_event(payload),
        _ => Ok(None),
    }
}

fn extract_repository_event(payload: &JsonValue) -> Result<Option<TypedEvent>, ConnectorError> {
    let action = payload
        .get("action")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| ConnectorError::InvalidWebhookEvent("missing action".to_string()))?;

    let name = match action {
        "created" => "repository_creation",
        "deleted" => "repository_deletion",
        _ => return Ok(None),
    };

    let organization = required_str(payload, &["organization", "login"], "organization login")?;
    let repository = required_str(payload, &["repository", "name"], "repository name")?;

    let time_field = if name == "repository_creation" {
        "created_at"
    } else {
        "updated_at"
    };
    let event_time = payload
        .get("repository")
        .and_then(|repo| repo.get(time_field))
        .and_then(JsonValue::as_str)
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok());

    Ok(Some(TypedEvent {
        name,
        data: json!({
            "organization": &organization,
            "repository": &repository,
        }),
        organization,
        repository: Some(repository),
        event_time,
    }))
}

fn extract_push_event(payload: &JsonValue) -> Result<Option<TypedEvent>, ConnectorError> {
    let organization = required_str(payload, &["organization", "login"], "organization login")?;
    let repository = required_str(payload, &["repository", "name"], "repository name")?;

    let reference = required_str_direct(payload, "ref")?;
    let Some(branch) = reference.strip_prefix("refs/heads/") else {
        // Tag and other ref pushes do not produce push events.
        return Ok(None);
    };

    let old_revision = required_str_direct(payload, "before")?;
    let new_revision = required_str_direct(payload, "after")?;

    Ok(Some(TypedEvent {
        name: "push",
        data: json!({
            "organization": &organization,
            "repository": &repository,
            "branch": branch,
            "old_revision": old_revision,
            "new_revision": new_revision,
        }),
        organization,
        repository: Some(repository),
        event_time: None,
    }))
}

fn required_str(
    payload: &JsonValue,
    path: &[&str],
    description: &str,
) -> Result<String, ConnectorError> {
    let mut value = payload;
    for key in path {
        value = value.get(key).ok_or_else(|| {
            ConnectorError::InvalidWebhookEvent(format!("missing {description}"))
        })?;
    }

    value
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| ConnectorError::InvalidWebhookEvent(format!("missing {description}")))
}

fn required_str_direct(payload: &JsonValue, key: &str) -> Result<String, ConnectorError> {
    required_str(payload, &[key], key)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> GithubConnector {
        GithubConnector::new(
            "webhook-key".to_string(),
            Url::parse("https://jobline.example.com").unwrap(),
        )
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn webhook_secret_is_deterministic() {
        let connector = connector();
        let first = connector.webhook_secret("acme/tool");
        let second = connector.webhook_secret("acme/tool");
        assert_eq!(first, second);
        assert_ne!(first, connector.webhook_secret("acme/other"));
    }

    #[test]
    fn webhook_uri_escapes_target() {
        let connector = connector();
        let uri = connector.webhook_uri("acme/tool").unwrap();
        assert_eq!(
            uri.as_str(),
            "https://jobline.example.com/ext/connectors/github/hooks/acme%2Ftool"
        );
    }

    #[test]
    fn signature_roundtrip_verifies() {
        let connector = connector();
        let secret = connector.webhook_secret("acme/tool");
        let body = br#"{"zen": "speak like a human"}"#;

        let header = sign(&secret, body);
        assert!(GithubConnector::verify_signature(&secret, Some(&header), body).is_ok());
    }

    #[test]
    fn bad_signature_is_rejected() {
        let connector = connector();
        let secret = connector.webhook_secret("acme/tool");
        let body = b"payload";

        let wrong = sign("other-secret", body);
        assert!(matches!(
            GithubConnector::verify_signature(&secret, Some(&wrong), body),
            Err(ConnectorError::InvalidSignature)
        ));
        assert!(matches!(
            GithubConnector::verify_signature(&secret, None, body),
            Err(ConnectorError::InvalidSignature)
        ));
        assert!(matches!(
            GithubConnector::verify_signature(&secret, Some("not-prefixed"), body),
            Err(ConnectorError::InvalidSignature)
        ));
    }

    #[test]
    fn target_parsing() {
        assert_eq!(
            WebhookTarget::parse("acme").unwrap(),
            WebhookTarget {
                organization: "acme".to_string(),
                repository: None,
            }
        );
        assert_eq!(
            WebhookTarget::parse("acme/tool").unwrap(),
            WebhookTarget {
                organization: "acme".to_string(),
                repository: Some("tool".to_string()),
            }
        );
        assert!(WebhookTarget::parse("").is_err());
        assert!(WebhookTarget::parse("acme/").is_err());
        assert!(WebhookTarget::parse("acme/a/b").is_err());
    }

    #[test]
    fn repository_created_payload_yields_typed_event() {
        let payload = serde_json::json!({
            "action": "created",
            "organization": {"login": "acme"},
            "repository": {"name": "tool", "created_at": "2026-01-05T10:00:00Z"},
        });

        let typed = extract_typed_event("repository", &payload).unwrap().unwrap();
        assert_eq!(typed.name, "repository_creation");
        assert_eq!(typed.organization, "acme");
        assert_eq!(typed.repository.as_deref(), Some("tool"));
        assert!(typed.event_time.is_some());
        assert_eq!(typed.data["repository"], "tool");
    }

    #[test]
    fn repository_payload_without_action_is_invalid() {
        let payload = serde_json::json!({
            "organization": {"login": "acme"},
            "repository": {"name": "tool"},
        });

        assert!(matches!(
            extract_typed_event("repository", &payload),
            Err(ConnectorError::InvalidWebhookEvent(_))
        ));
    }

    #[test]
    fn repository_archived_action_is_ignored() {
        let payload = serde_json::json!({
            "action": "archived",
            "organization": {"login": "acme"},
            "repository": {"name": "tool"},
        });

        assert!(extract_typed_event("repository", &payload)
            .unwrap()
            .is_none());
    }

    #[test]
    fn push_payload_yields_branch_revisions() {
        let payload = serde_json::json!({
            "ref": "refs/heads/main",
            "before": "6d2b7c1a",
            "after": "9f8e7d6c",
            "organization": {"login": "acme"},
            "repository": {"name": "tool"},
        });

        let typed = extract_typed_event("push", &payload).unwrap().unwrap();
        assert_eq!(typed.name, "push");
        assert_eq!(typed.data["branch"], "main");
        assert_eq!(typed.data["old_revision"], "6d2b7c1a");
        assert_eq!(typed.data["new_revision"], "9f8e7d6c");
    }

    #[test]
    fn tag_push_is_ignored() {
        let payload = serde_json::json!({
            "ref": "refs/tags/v1.0.0",
            "before": "6d2b7c1a",
            "after": "9f8e7d6c",
            "organization": {"login": "acme"},
            "repository": {"name": "tool"},
        });

        assert!(extract_typed_event("push", &payload).unwrap().is_none());
    }

    #[test]
    fn unrelated_event_types_are_ignored() {
        let payload = serde_json::json!({"zen": "keep it simple"});
        assert!(extract_typed_event("ping", &payload).unwrap().is_none());
    }
}
