//! # HTTP Handlers
//!
//! Handlers for the service's HTTP ingress surface.

pub mod hooks;

use axum::response::Json;

use crate::models::ServiceInfo;

/// Root endpoint returning basic service information.
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "service"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}
