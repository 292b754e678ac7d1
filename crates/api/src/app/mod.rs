//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: builds the sync and job core from configuration
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// Everything except `/health` lives under `/admin`; authentication is left
/// to the gateway in front of this service.
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/admin", routes::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
