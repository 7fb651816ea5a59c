//! Webhook ingress handler.
//!
//! `POST /ext/connectors/{connector}/hooks/{target}` routes a provider
//! delivery to the named connector, which authenticates it and turns it into
//! durable events in a single transaction.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use tracing::debug;

use crate::connectors::Registry;
use crate::error::ApiError;
use crate::server::AppState;

/// Accept a webhook delivery from an external provider.
///
/// The target is URL-path-escaped UTF-8 derived from subscription
/// parameters; its per-target secret authenticates the delivery without any
/// database lookup.
#[utoipa::path(
    post,
    path = "/ext/connectors/{connector}/hooks/{target}",
    params(
        ("connector" = String, Path, description = "Connector name"),
        ("target" = String, Path, description = "Path-escaped webhook target")
    ),
    request_body(content = Vec<u8>, description = "Raw provider webhook payload", content_type = "application/octet-stream"),
    responses(
        (status = 204, description = "Delivery accepted"),
        (status = 400, description = "Invalid payload shape", body = ApiError),
        (status = 401, description = "Invalid signature", body = ApiError),
        (status = 404, description = "Unknown connector", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn ingest_webhook(
    State(state): State<AppState>,
    Path((connector, target)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    debug!(
        connector = %connector,
        hook_target = %target,
        body_size = body.len(),
        "processing webhook delivery"
    );

    let connector = Registry::lookup(&connector)?;

    connector
        .process_webhook(&state.db, &target, &headers, &body)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}
