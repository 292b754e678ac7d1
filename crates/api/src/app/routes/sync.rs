//! Mirror synchronization routes.
//!
//! Partial success is a normal outcome: reconcile and pull return their
//! reports with per-item errors and a 200.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use rotv_infra::sync::OperationId;

use crate::app::dto::DiscardResponse;
use crate::app::errors;
use crate::app::services::AppServices;

/// POST /admin/sync/reconcile
pub async fn reconcile(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.core().reconciler().reconcile().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::sync_error_to_response(e),
    }
}

/// POST /admin/sync/push
pub async fn push(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.core().full_sync().push().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::sync_error_to_response(e),
    }
}

/// POST /admin/sync/pull
pub async fn pull(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.core().full_sync().pull().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::sync_error_to_response(e),
    }
}

/// GET /admin/sync/status
pub async fn status(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.core().sync_status().await {
        Ok(view) => Json(view).into_response(),
        Err(e) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    }
}

/// DELETE /admin/sync/operations/:id
pub async fn discard_operation(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(uuid) = Uuid::parse_str(id.trim()) else {
        return errors::invalid_id(&id);
    };
    match services.core().discard_operation(OperationId::from_uuid(uuid)).await {
        Ok(true) => Json(DiscardResponse {
            operation_id: uuid.to_string(),
            discarded: true,
        })
        .into_response(),
        Ok(false) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no pending operation {uuid}"),
        ),
        Err(e) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "queue_error", e.to_string()),
    }
}
