use axum::{
    Router,
    routing::{delete, get, post},
};

pub mod jobs;
pub mod sync;
pub mod system;

/// Router for the `/admin` surface.
pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(jobs::submit_job).get(jobs::list_jobs))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/cancel", post(jobs::cancel_job))
        .route("/providers/stats", get(jobs::provider_stats))
        .route("/sync/reconcile", post(sync::reconcile))
        .route("/sync/push", post(sync::push))
        .route("/sync/pull", post(sync::pull))
        .route("/sync/status", get(sync::status))
        .route("/sync/operations/:id", delete(sync::discard_operation))
}
