//! Batch job routes.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
};

use rotv_infra::jobs::{JobId, NEWS_COLLECTION};

use crate::app::dto::{ListQuery, SubmitJobRequest};
use crate::app::errors;
use crate::app::services::AppServices;

/// POST /admin/jobs
///
/// An empty body submits a news collection over every destination.
pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Bytes,
) -> axum::response::Response {
    let body: SubmitJobRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SubmitJobRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(b) => b,
            Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", e.to_string()),
        }
    };
    let job_type = body
        .job_type
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| NEWS_COLLECTION.to_string());

    let core = services.core();
    let submitted = match body.unit_ids {
        Some(unit_ids) => core.dispatcher().submit_job(&job_type, unit_ids).await,
        None => core.submit_for_all(&job_type).await,
    };
    match submitted {
        Ok(job) => (StatusCode::ACCEPTED, Json(job)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// GET /admin/jobs
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListQuery>,
) -> axum::response::Response {
    match services.core().dispatcher().list_jobs(query.limit()).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// GET /admin/jobs/:id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(job_id) = id.parse::<JobId>() else {
        return errors::invalid_id(&id);
    };
    match services.core().dispatcher().job(job_id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// POST /admin/jobs/:id/cancel
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(job_id) = id.parse::<JobId>() else {
        return errors::invalid_id(&id);
    };
    match services.core().dispatcher().cancel_job(job_id).await {
        Ok(ack) => Json(ack).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// GET /admin/providers/stats
pub async fn provider_stats(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(services.core().dispatcher().provider_stats())
}
