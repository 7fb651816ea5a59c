//! # Error Handling
//!
//! Unified error responses for the HTTP ingress surface, using a consistent
//! problem+json format.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::connectors::{ConnectorError, RegistryError};

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn internal(message: &str) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            message,
        )
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<ConnectorError> for ApiError {
    fn from(err: ConnectorError) -> Self {
        match &err {
            ConnectorError::InvalidSignature => ApiError::new(
                StatusCode::UNAUTHORIZED,
                "INVALID_SIGNATURE".to_string(),
                err.to_string(),
            ),
            ConnectorError::InvalidWebhookEvent(_) | ConnectorError::InvalidIdentityData(_) => {
                ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "INVALID_WEBHOOK_EVENT".to_string(),
                    err.to_string(),
                )
            }
            ConnectorError::WebhookNotSupported(_) => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND".to_string(),
                err.to_string(),
            ),
            ConnectorError::NotConfigured(_) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "NOT_CONFIGURED".to_string(),
                err.to_string(),
            ),
            ConnectorError::Store(err) => {
                tracing::error!(error = %err, "store failure in webhook path");
                ApiError::internal("store failure")
            }
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match &err {
            RegistryError::ConnectorNotFound { .. } => ApiError::not_found(&err.to_string()),
            RegistryError::InvalidBaseUri { .. } => ApiError::internal(&err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn api_error_carries_code_and_message() {
        let error = ApiError::new(StatusCode::BAD_REQUEST, "INVALID_WEBHOOK_EVENT", "bad shape");

        assert_eq!(error.code, "INVALID_WEBHOOK_EVENT");
        assert_eq!(error.message, "bad shape");
        assert!(error.details.is_none());
    }

    #[test]
    fn response_has_problem_json_content_type() {
        let error = ApiError::new(StatusCode::BAD_REQUEST, "INVALID_WEBHOOK_EVENT", "bad shape")
            .with_details(json!({"field": "action"}));

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn connector_errors_map_to_expected_statuses() {
        let cases = [
            (
                ApiError::from(ConnectorError::InvalidSignature),
                StatusCode::UNAUTHORIZED,
            ),
            (
                ApiError::from(ConnectorError::InvalidWebhookEvent("bad".to_string())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(ConnectorError::WebhookNotSupported("time".to_string())),
                StatusCode::NOT_FOUND,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(error.status, status);
        }
    }
}
