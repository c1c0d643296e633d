//! Application setup and server configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::Extension,
    http::{header::CONTENT_TYPE, HeaderName, Method, Request},
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::JobsKernel;
use crate::server::routes::{get_job_handler, health_handler, submit_job_handler};

/// Upper bound on any single request; enqueue and poll are single round trips.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<JobsKernel>,
}

/// Build the Axum application router.
///
/// Worker pools are not started here; `main` owns their lifecycle so tests
/// can drive the router without background processing.
pub fn build_app(kernel: Arc<JobsKernel>) -> Router {
    let app_state = AppState { kernel };

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE, HeaderName::from_static("x-user-id")])
        .expose_headers([
            HeaderName::from_static("x-job-id"),
            HeaderName::from_static("x-queue-state"),
        ]);

    // x-user-id is only ever recorded on the request span
    let trace = TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
        let user_id = request
            .headers()
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("-");
        tracing::info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            user_id = %user_id,
        )
    });

    Router::new()
        .route("/jobs", get(get_job_handler).post(submit_job_handler))
        .route("/health", get(health_handler))
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(Extension(app_state))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors)
        .layer(trace)
}
