//! Idempotent job submission.
//!
//! The job id is derived from the submission itself, so submitting the same
//! work twice lands on the same record: the second insert hits the primary
//! key and is reported as an existing job rather than an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::error::{JobsError, StoreError, ValidationError};
use super::job::{JobPayload, JobState, NewJob, QueueName};
use super::router::QueueRouter;

const MAX_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Hold the job in `delayed` until this much time has passed
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOutcome {
    pub job_id: String,
    pub queue: QueueName,
    /// State read back after the insert; `None` if the read failed
    pub state: Option<JobState>,
    /// `false` when the job already existed
    pub created: bool,
}

pub struct Enqueuer {
    router: Arc<QueueRouter>,
}

impl Enqueuer {
    pub fn new(router: Arc<QueueRouter>) -> Self {
        Self { router }
    }

    /// Enqueue a validated payload on the queue that owns its kind.
    pub async fn submit(
        &self,
        payload: &JobPayload,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, JobsError> {
        let job_id = payload.job_id()?;
        self.enqueue(payload.queue().as_str(), payload, &job_id, options)
            .await
    }

    pub async fn enqueue(
        &self,
        queue_name: &str,
        payload: &JobPayload,
        job_id: &str,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, JobsError> {
        let queue = self.router.resolve(queue_name)?;
        let settings = queue.settings();

        let run_at = match options.delay {
            Some(delay) if delay > MAX_DELAY => {
                return Err(ValidationError::invalid("delay_ms", "exceeds 7 days").into());
            }
            Some(delay) if !delay.is_zero() => chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| Utc::now().checked_add_signed(delay)),
            _ => None,
        };

        let mut job = NewJob::builder()
            .id(job_id)
            .queue_name(queue.name())
            .job_type(payload.kind().as_str())
            .payload(payload.to_value()?)
            .max_attempts(settings.max_attempts)
            .backoff_base_ms(settings.backoff_base.as_millis() as i64)
            .build();
        job.run_at = run_at;

        let created = match queue.store().insert(job).await {
            Ok(state) => {
                info!(job_id, queue = %queue.name(), job_type = %payload.kind(), %state, "job enqueued");
                true
            }
            Err(StoreError::Conflict(_)) => {
                debug!(job_id, queue = %queue.name(), "job already queued");
                false
            }
            Err(e) => {
                error!(job_id, queue = %queue.name(), phase = "enqueue", error = %e, "enqueue failed");
                return Err(e.into());
            }
        };

        let state = match queue.find(job_id).await {
            Ok(found) => found.map(|job| job.state),
            Err(e) => {
                warn!(job_id, queue = %queue.name(), error = %e, "could not read back job state");
                None
            }
        };

        Ok(EnqueueOutcome {
            job_id: job_id.to_string(),
            queue: queue.name(),
            state,
            created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::kernel::store::MemoryJobStore;
    use serde_json::json;

    fn setup() -> (Arc<MemoryJobStore>, Enqueuer) {
        let store = Arc::new(MemoryJobStore::new());
        let router = Arc::new(QueueRouter::new(store.clone(), QueueConfig::default()));
        (store, Enqueuer::new(router))
    }

    fn ask(prompt: &str) -> JobPayload {
        JobPayload::parse("ask", json!({ "prompt": prompt })).unwrap()
    }

    #[tokio::test]
    async fn concurrent_submissions_create_exactly_once() {
        let (store, enqueuer) = setup();
        let payload = ask("racing");

        let outcomes = futures::future::join_all(
            (0..10).map(|_| enqueuer.submit(&payload, EnqueueOptions::default())),
        )
        .await;

        let outcomes: Vec<_> = outcomes.into_iter().map(|o| o.unwrap()).collect();
        assert_eq!(store.len(), 1);
        assert_eq!(outcomes.iter().filter(|o| o.created).count(), 1);
        assert!(outcomes.iter().all(|o| o.job_id == outcomes[0].job_id));
    }

    #[tokio::test]
    async fn resubmission_returns_same_job() {
        let (store, enqueuer) = setup();

        let first = enqueuer.submit(&ask("what is a tide?"), EnqueueOptions::default()).await.unwrap();
        let second = enqueuer.submit(&ask("what is a tide?"), EnqueueOptions::default()).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(second.state, Some(JobState::Waiting));
        assert_eq!(first.queue, QueueName::Interactive);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn background_kind_lands_on_background_queue() {
        let (_store, enqueuer) = setup();
        let payload = JobPayload::parse("lesson_plan", json!({"topic": "photosynthesis"})).unwrap();

        let outcome = enqueuer.submit(&payload, EnqueueOptions::default()).await.unwrap();
        assert_eq!(outcome.queue, QueueName::Background);
    }

    #[tokio::test]
    async fn delay_option_schedules_job() {
        let (_store, enqueuer) = setup();
        let options = EnqueueOptions {
            delay: Some(Duration::from_secs(60)),
        };

        let outcome = enqueuer.submit(&ask("later"), options).await.unwrap();
        assert_eq!(outcome.state, Some(JobState::Delayed));
    }

    #[tokio::test]
    async fn oversized_delay_is_rejected() {
        let (store, enqueuer) = setup();
        let options = EnqueueOptions {
            delay: Some(MAX_DELAY + Duration::from_secs(1)),
        };

        let err = enqueuer.submit(&ask("much later"), options).await.unwrap_err();
        assert!(matches!(err, JobsError::Validation(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unknown_queue_is_rejected() {
        let (_store, enqueuer) = setup();
        let payload = ask("hi");
        let id = payload.job_id().unwrap();

        let err = enqueuer
            .enqueue("urgent", &payload, &id, EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobsError::UnknownQueue(_)));
    }

    #[tokio::test]
    async fn store_outage_propagates() {
        let (store, enqueuer) = setup();
        store.set_available(false);

        let err = enqueuer.submit(&ask("hi"), EnqueueOptions::default()).await.unwrap_err();
        assert!(matches!(err, JobsError::Store(e) if e.is_unavailable()));
    }
}
