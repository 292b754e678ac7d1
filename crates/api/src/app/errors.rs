use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use rotv_infra::jobs::{DispatchError, JobStoreError};
use rotv_infra::sync::SyncError;

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    match err {
        DispatchError::ShuttingDown => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "shutting_down", err.to_string())
        }
        DispatchError::NotFound(_) | DispatchError::Store(JobStoreError::NotFound(_)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        DispatchError::Store(JobStoreError::AlreadyTerminal { .. })
        | DispatchError::Store(JobStoreError::InvalidTransition { .. }) => {
            json_error(StatusCode::CONFLICT, "conflict", err.to_string())
        }
        DispatchError::Store(JobStoreError::TooManyUnits { .. }) => {
            json_error(StatusCode::BAD_REQUEST, "too_many_units", err.to_string())
        }
        DispatchError::Store(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
        DispatchError::Repository(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        DispatchError::RegistryPoisoned => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
        }
    }
}

pub fn sync_error_to_response(err: SyncError) -> axum::response::Response {
    match err {
        SyncError::Busy { .. } => json_error(StatusCode::CONFLICT, "sync_in_progress", err.to_string()),
        SyncError::Mirror(e) if e.is_fatal() => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "mirror_unavailable", e.to_string())
        }
        SyncError::Mirror(e) => json_error(StatusCode::BAD_GATEWAY, "mirror_error", e.to_string()),
        SyncError::Queue(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "queue_error", e.to_string()),
        SyncError::Repository(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn invalid_id(raw: &str) -> axum::response::Response {
    json_error(
        StatusCode::BAD_REQUEST,
        "invalid_id",
        format!("{raw:?} is not a valid id"),
    )
}
