// Common test utilities
#![allow(dead_code)]

pub mod harness;

pub use harness::*;

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;
use tutor_jobs::kernel::jobs::testing::StubHandlers;
use tutor_jobs::kernel::{JobsKernel, JobsSettings, MemoryJobStore};

/// A response with its body decoded as JSON (`Null` when empty).
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Kernel over an in-memory store with stub handlers.
pub fn memory_kernel(settings: JobsSettings) -> Arc<JobsKernel> {
    memory_kernel_with_store(settings).0
}

/// Like [`memory_kernel`], also handing back the store for inspection.
pub fn memory_kernel_with_store(settings: JobsSettings) -> (Arc<JobsKernel>, Arc<MemoryJobStore>) {
    let store = Arc::new(MemoryJobStore::new());
    let kernel = Arc::new(JobsKernel::new(
        store.clone(),
        Arc::new(StubHandlers::new()),
        settings,
    ));
    (kernel, store)
}

pub async fn send(app: &Router, request: Request<Body>) -> TestResponse {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };

    TestResponse {
        status,
        headers,
        body,
    }
}

pub async fn post_job(app: &Router, body: Value) -> TestResponse {
    send(
        app,
        Request::post("/jobs")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
}

pub async fn get(app: &Router, uri: &str) -> TestResponse {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

/// Poll `GET /jobs?id=` until `state` matches or the timeout elapses.
pub async fn poll_until(app: &Router, job_id: &str, state: &str) -> TestResponse {
    let uri = format!("/jobs?id={job_id}");
    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        loop {
            let response = get(app, &uri).await;
            if response.body["state"] == state {
                return response;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {job_id} never reached {state}"))
}
