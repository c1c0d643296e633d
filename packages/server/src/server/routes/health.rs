use std::time::Duration;

use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;

use crate::kernel::jobs::ConnectivityProbe;
use crate::server::app::AppState;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    store: ConnectivityProbe,
}

/// Health check endpoint
///
/// Probes the job store without establishing a new connection. Returns
/// 200 OK when the store answered, 503 Service Unavailable otherwise.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let probe = match tokio::time::timeout(PROBE_TIMEOUT, state.kernel.router.store().probe()).await
    {
        Ok(probe) => probe,
        Err(_) => ConnectivityProbe::down("probe timeout (>5s)"),
    };

    let (status_code, status) = if probe.ok {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    (
        status_code,
        Json(HealthResponse {
            status: status.to_string(),
            store: probe,
        }),
    )
}
