//! Runs one claimed job through its handler.
//!
//! The processor never fails: handler errors and panics become `failure`
//! results, and payloads that no longer decode become `ignored` results.
//! What to do with a failure (retry or give up) is the worker pool's call.

use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{error, warn};

use super::job::{
    AskPayload, AskResult, BackfillResult, ContentBackfillPayload, JobKind, JobPayload,
    JobRecord, LessonPlanPayload, LessonPlanResult, PreflightResult, ResultMeta,
    TutorPreflightPayload, WorkerResult,
};

/// Handler output plus what the handler wants recorded about the call.
#[derive(Debug, Clone, PartialEq)]
pub struct Handled<T> {
    pub value: T,
    pub model: Option<String>,
    pub retrieval_calls: Option<u32>,
}

impl<T> Handled<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            model: None,
            retrieval_calls: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_retrieval_calls(mut self, calls: u32) -> Self {
        self.retrieval_calls = Some(calls);
        self
    }

    fn meta(&self) -> ResultMeta {
        ResultMeta {
            model: self.model.clone(),
            retrieval_calls: self.retrieval_calls,
            ..ResultMeta::default()
        }
    }
}

/// One method per job kind.
#[async_trait]
pub trait JobHandlers: Send + Sync {
    /// Recorded as `meta.handler` on every result.
    fn name(&self) -> &str;

    async fn ask(&self, payload: AskPayload) -> Result<Handled<AskResult>>;

    async fn tutor_preflight(&self, payload: TutorPreflightPayload) -> Result<Handled<PreflightResult>>;

    async fn lesson_plan(&self, payload: LessonPlanPayload) -> Result<Handled<LessonPlanResult>>;

    async fn content_backfill(
        &self,
        payload: ContentBackfillPayload,
    ) -> Result<Handled<BackfillResult>>;
}

pub struct JobProcessor {
    handlers: Arc<dyn JobHandlers>,
}

impl JobProcessor {
    pub fn new(handlers: Arc<dyn JobHandlers>) -> Self {
        Self { handlers }
    }

    /// Execute a claimed job. `claimed_at` is when the worker took it.
    pub async fn process(&self, job: &JobRecord, claimed_at: DateTime<Utc>) -> WorkerResult {
        let started = Instant::now();

        let mut result = match decode(job) {
            Ok(payload) => {
                match AssertUnwindSafe(self.dispatch(payload)).catch_unwind().await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => {
                        warn!(job_id = %job.id, job_type = %job.job_type, phase = "handler", error = %e, "handler failed");
                        WorkerResult::failure(format!("{e:#}"), Some(format!("{e:?}")))
                    }
                    Err(panic_info) => {
                        let panic_msg = extract_panic_message(&panic_info);
                        error!(job_id = %job.id, job_type = %job.job_type, panic = %panic_msg, "handler panicked");
                        WorkerResult::failure(format!("handler panicked: {panic_msg}"), None)
                    }
                }
            }
            Err(reason) => {
                warn!(job_id = %job.id, job_type = %job.job_type, %reason, "ignoring undecodable job");
                WorkerResult::ignored(reason)
            }
        };

        let handler_ms = started.elapsed().as_millis() as u64;
        let queue_wait_ms = (claimed_at - job.created_at).num_milliseconds().max(0) as u64;

        let meta = result.meta_mut();
        meta.queue_wait_ms = queue_wait_ms;
        meta.handler_ms = handler_ms;
        meta.total_ms = queue_wait_ms + handler_ms;
        meta.handler = self.handlers.name().to_string();
        meta.attempt = job.attempts;

        result
    }

    async fn dispatch(&self, payload: JobPayload) -> Result<WorkerResult> {
        let result = match payload {
            JobPayload::Ask(payload) => {
                let handled = self.handlers.ask(payload).await?;
                WorkerResult::Ask {
                    meta: handled.meta(),
                    result: handled.value,
                }
            }
            JobPayload::TutorPreflight(payload) => {
                let handled = self.handlers.tutor_preflight(payload).await?;
                WorkerResult::TutorPreflight {
                    meta: handled.meta(),
                    result: handled.value,
                }
            }
            JobPayload::LessonPlan(payload) => {
                let handled = self.handlers.lesson_plan(payload).await?;
                WorkerResult::LessonPlan {
                    meta: handled.meta(),
                    result: handled.value,
                }
            }
            JobPayload::ContentBackfill(payload) => {
                let handled = self.handlers.content_backfill(payload).await?;
                WorkerResult::ContentBackfill {
                    meta: handled.meta(),
                    result: handled.value,
                }
            }
        };
        Ok(result)
    }
}

fn decode(job: &JobRecord) -> Result<JobPayload, String> {
    let kind = JobKind::from_str(&job.job_type).map_err(|e| e.to_string())?;
    JobPayload::decode(kind, job.payload.clone()).map_err(|e| e.to_string())
}

/// Extract a human-readable message from a panic payload.
fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
