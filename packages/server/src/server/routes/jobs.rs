//! `/jobs` submission and status polling.
//!
//! Every response carries `x-job-id` (when an id is known) and
//! `x-queue-state` so client and server logs can be correlated.

use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Extension, Query},
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{error, warn};

use crate::common::utils::is_job_id;
use crate::kernel::jobs::{
    retry_after_secs, EnqueueOptions, JobPayload, JobView, JobsError, QueueState, Resolution,
};
use crate::server::app::AppState;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 200;
/// Retry hint sent with 503 responses to submissions.
const UNAVAILABLE_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
    /// Hold the job in `delayed` for this many milliseconds
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobsQuery {
    pub id: Option<String>,
    pub debug: Option<String>,
    pub stats: Option<String>,
    pub list: Option<String>,
    pub limit: Option<i64>,
}

fn flag(value: &Option<String>) -> bool {
    matches!(value.as_deref(), Some("1") | Some("true"))
}

/// A JSON response with the correlation headers attached.
fn respond(
    status: StatusCode,
    body: Value,
    job_id: Option<&str>,
    state: QueueState,
    retry_after: Option<Duration>,
) -> Response {
    let mut headers = HeaderMap::new();
    if let Some(value) = job_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        headers.insert("x-job-id", value);
    }
    headers.insert("x-queue-state", HeaderValue::from_static(state.as_str()));
    if let Some(delay) = retry_after {
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(delay)));
    }

    (status, headers, Json(body)).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    respond(
        StatusCode::BAD_REQUEST,
        json!({ "error": message.into() }),
        None,
        QueueState::Unknown,
        None,
    )
}

/// `POST /jobs` - validate, derive the id, enqueue idempotently.
pub async fn submit_job_handler(
    Extension(state): Extension<AppState>,
    request: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    let payload = match JobPayload::parse(&request.job_type, request.payload) {
        Ok(payload) => payload,
        Err(e) => return bad_request(e.to_string()),
    };

    let options = EnqueueOptions {
        delay: request.delay_ms.map(Duration::from_millis),
    };
    let job_id = payload.job_id().ok();

    match state.kernel.submit(&payload, options).await {
        Ok(outcome) => {
            let queue_state = outcome
                .state
                .map(QueueState::from)
                .unwrap_or(QueueState::Unknown);
            respond(
                StatusCode::ACCEPTED,
                json!({
                    "accepted": true,
                    "jobId": &outcome.job_id,
                    "state": queue_state,
                }),
                Some(&outcome.job_id),
                queue_state,
                None,
            )
        }
        Err(JobsError::Validation(e)) => bad_request(e.to_string()),
        Err(JobsError::Store(e)) if e.is_unavailable() => {
            warn!(phase = "enqueue", error = %e, "job store unavailable");
            respond(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "job store unavailable", "jobId": &job_id }),
                job_id.as_deref(),
                QueueState::Unknown,
                Some(UNAVAILABLE_RETRY),
            )
        }
        Err(e) => {
            error!(phase = "enqueue", error = %e, "failed to enqueue job");
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "failed to enqueue job", "jobId": &job_id }),
                job_id.as_deref(),
                QueueState::Unknown,
                None,
            )
        }
    }
}

/// `GET /jobs` - status by `id`, or `stats=1` / `list=1` for operators.
pub async fn get_job_handler(
    Extension(state): Extension<AppState>,
    Query(query): Query<JobsQuery>,
) -> Response {
    if flag(&query.stats) {
        let diagnostics = state.kernel.diagnostics().await;
        return respond(
            StatusCode::OK,
            json!(diagnostics),
            None,
            QueueState::Unknown,
            None,
        );
    }

    if flag(&query.list) {
        let limit = query
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        return match state.kernel.in_flight(limit).await {
            Ok(queues) => respond(
                StatusCode::OK,
                json!({ "limit": limit, "queues": queues }),
                None,
                QueueState::Unknown,
                None,
            ),
            Err(e) => {
                warn!(phase = "list", error = %e, "in-flight listing failed");
                let status = if e.is_unavailable() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                respond(
                    status,
                    json!({ "error": "listing unavailable" }),
                    None,
                    QueueState::Unknown,
                    None,
                )
            }
        };
    }

    let Some(job_id) = query.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) else {
        return bad_request("missing `id` query parameter");
    };
    if !is_job_id(job_id) {
        return bad_request("`id` must be a 64-character hex job id");
    }

    let debug = flag(&query.debug);
    match state.kernel.status(job_id, debug).await {
        Ok(Resolution::Found(view)) => found_response(view),
        Ok(Resolution::NotFound {
            job_id,
            retry_after,
            hits,
        }) => respond(
            StatusCode::NOT_FOUND,
            json!({
                "jobId": &job_id,
                "state": QueueState::NotFound,
                "retryAfterMs": retry_after.as_millis() as u64,
                "misses": hits,
            }),
            Some(&job_id),
            QueueState::NotFound,
            Some(retry_after),
        ),
        Ok(Resolution::Gone { job_id, hits }) => respond(
            StatusCode::GONE,
            json!({
                "jobId": &job_id,
                "state": QueueState::Gone,
                "misses": hits,
            }),
            Some(&job_id),
            QueueState::Gone,
            None,
        ),
        Ok(Resolution::Unavailable {
            job_id,
            retry_after,
            error,
            diagnostics,
        }) => {
            let mut body = json!({
                "jobId": &job_id,
                "state": QueueState::Unknown,
                "error": "job store unavailable",
                "retryAfterMs": retry_after.as_millis() as u64,
            });
            if debug {
                body["debug"] = json!({ "error": error, "stats": diagnostics });
            }
            respond(
                StatusCode::SERVICE_UNAVAILABLE,
                body,
                Some(&job_id),
                QueueState::Unknown,
                Some(retry_after),
            )
        }
        Err(e) => {
            error!(job_id, phase = "status", error = %e, "status lookup failed");
            let mut body = json!({
                "jobId": &job_id,
                "state": QueueState::Unknown,
                "error": "status lookup failed",
            });
            if debug {
                body["debug"] = json!({ "error": e.to_string() });
            }
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                body,
                Some(job_id),
                QueueState::Unknown,
                None,
            )
        }
    }
}

fn found_response(view: JobView) -> Response {
    let mut body = Map::new();
    body.insert("jobId".into(), json!(view.job_id));
    body.insert("state".into(), json!(view.state));
    body.insert("progress".into(), json!(view.progress));
    if let Some(delay) = view.retry_after {
        body.insert("retryAfterMs".into(), json!(delay.as_millis() as u64));
    }
    if let Some(result) = &view.result {
        body.insert("result".into(), result.clone());
    }
    if let Some(error) = &view.error {
        body.insert("error".into(), json!(error));
    }
    if let Some(debug) = &view.debug {
        body.insert("debug".into(), json!(debug));
    }

    // Failed jobs answer 500 even though the poll itself succeeded
    let status = if view.state == QueueState::Failed {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };

    respond(
        status,
        Value::Object(body),
        Some(&view.job_id),
        view.state,
        view.retry_after,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_accepts_one_and_true() {
        assert!(flag(&Some("1".into())));
        assert!(flag(&Some("true".into())));
        assert!(!flag(&Some("0".into())));
        assert!(!flag(&None));
    }

    #[test]
    fn respond_sets_correlation_headers() {
        let response = respond(
            StatusCode::NOT_FOUND,
            json!({}),
            Some("abc"),
            QueueState::NotFound,
            Some(Duration::from_millis(1500)),
        );
        let headers = response.headers();
        assert_eq!(headers["x-job-id"], "abc");
        assert_eq!(headers["x-queue-state"], "not_found");
        assert_eq!(headers["retry-after"], "2");
    }

    #[test]
    fn respond_omits_missing_job_id() {
        let response = respond(StatusCode::OK, json!({}), None, QueueState::Unknown, None);
        assert!(response.headers().get("x-job-id").is_none());
        assert!(response.headers().get("retry-after").is_none());
        assert_eq!(response.headers()["x-queue-state"], "unknown");
    }
}
