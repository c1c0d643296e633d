//! Worker pool for one queue.
//!
//! The `WorkerPool` is a long-running service that:
//! - Claims jobs from its queue while a concurrency slot is free
//! - Runs each job through the [`JobProcessor`] on its own task
//! - Extends the claim lease while the handler runs (heartbeat)
//! - Records the outcome: completed, retry as `delayed`, or failed
//!
//! # Architecture
//!
//! ```text
//! WorkerPool (per queue)
//!     │
//!     ├─► Semaphore permit (queue concurrency)
//!     ├─► JobStore.claim (leased to this worker)
//!     ├─► JobProcessor.process (errors and panics become failure results)
//!     │       └─► heartbeat: JobStore.extend_lease
//!     └─► JobStore.complete / JobStore.fail
//! ```
//!
//! Every store write after the claim carries the claimed attempt number,
//! so a run whose lease lapsed cannot finish a job another slot reclaimed.
//!
//! Running handlers are never cancelled. On shutdown the pool stops
//! claiming and waits for in-flight jobs to finish.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::retry_delay;
use super::error::StoreError;
use super::job::{FailedAttempt, JobRecord, JobState, WorkerResult};
use super::processor::JobProcessor;
use super::router::QueueHandle;

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Worker ID recorded on claimed jobs
    pub worker_id: String,
    /// How long to wait when no jobs are available
    pub poll_interval: Duration,
    /// How long to wait after a failed claim
    pub error_backoff: Duration,
    /// How often to extend the lease; defaults to a third of the lease
    pub heartbeat_interval: Option<Duration>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval: Duration::from_millis(250),
            error_backoff: Duration::from_secs(1),
            heartbeat_interval: None,
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

pub struct WorkerPool {
    queue: Arc<QueueHandle>,
    processor: Arc<JobProcessor>,
    config: WorkerPoolConfig,
    slots: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(queue: Arc<QueueHandle>, processor: Arc<JobProcessor>) -> Self {
        Self::with_config(queue, processor, WorkerPoolConfig::default())
    }

    pub fn with_config(
        queue: Arc<QueueHandle>,
        processor: Arc<JobProcessor>,
        config: WorkerPoolConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(queue.settings().concurrency.max(1)));
        Self {
            queue,
            processor,
            config,
            slots,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Claim and run a single job inline. Returns `false` when nothing was claimable.
    pub async fn process_next(&self) -> Result<bool, StoreError> {
        match self.claim().await? {
            Some(job) => {
                self.execute(job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Claim loop. Returns once `shutdown` fires and running jobs finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let queue = self.queue.name();
        info!(
            queue = %queue,
            worker_id = %self.config.worker_id,
            concurrency = self.queue.settings().concurrency,
            "worker pool starting"
        );

        let mut running = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.claim().await {
                Ok(Some(job)) => {
                    let pool = self.clone();
                    running.spawn(async move {
                        pool.execute(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(queue = %queue, phase = "claim", error = %e, "failed to claim job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }

            while let Some(joined) = running.try_join_next() {
                if let Err(e) = joined {
                    error!(queue = %queue, error = %e, "job task aborted");
                }
            }
        }

        if !running.is_empty() {
            info!(queue = %queue, count = running.len(), "waiting for running jobs to complete");
        }
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(queue = %queue, error = %e, "job task aborted");
            }
        }

        info!(queue = %queue, worker_id = %self.config.worker_id, "worker pool stopped");
    }

    async fn claim(&self) -> Result<Option<JobRecord>, StoreError> {
        let job = self
            .queue
            .store()
            .claim(
                self.queue.name(),
                &self.config.worker_id,
                self.queue.settings().lease_duration,
            )
            .await?;

        if let Some(job) = &job {
            debug!(job_id = %job.id, queue = %self.queue.name(), attempt = job.attempts, "claimed job");
        }
        Ok(job)
    }

    async fn execute(&self, job: JobRecord) {
        let claimed_at = job.processed_at.unwrap_or_else(Utc::now);

        let heartbeat_cancel = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(&job.id, job.attempts, heartbeat_cancel.clone());

        let result = self.processor.process(&job, claimed_at).await;

        heartbeat_cancel.cancel();
        let _ = heartbeat.await;

        self.record(&job, result).await;
    }

    fn spawn_heartbeat(
        &self,
        job_id: &str,
        attempt: i32,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.queue.store().clone();
        let lease = self.queue.settings().lease_duration;
        let interval = self
            .config
            .heartbeat_interval
            .unwrap_or(lease / 3)
            .max(Duration::from_millis(10));
        let job_id = job_id.to_string();
        let worker_id = self.config.worker_id.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match store.extend_lease(&job_id, &worker_id, attempt, lease).await {
                            Ok(true) => {}
                            Ok(false) => warn!(job_id = %job_id, "lease lost while running"),
                            Err(e) => warn!(job_id = %job_id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            }
        })
    }

    async fn record(&self, job: &JobRecord, result: WorkerResult) {
        let store = self.queue.store();
        let queue = self.queue.name();
        let worker_id = &self.config.worker_id;
        let meta = result.meta();

        let Some(failure) = result.as_failure() else {
            match store
                .complete(&job.id, worker_id, job.attempts, result.to_value())
                .await
            {
                Ok(true) => info!(
                    job_id = %job.id,
                    queue = %queue,
                    result_type = result.type_tag(),
                    queue_wait_ms = meta.queue_wait_ms,
                    handler_ms = meta.handler_ms,
                    "job completed"
                ),
                Ok(false) => warn!(job_id = %job.id, queue = %queue, "lease lost, result discarded"),
                Err(e) => error!(job_id = %job.id, queue = %queue, phase = "complete", error = %e, "failed to record completion"),
            }
            return;
        };

        let retry_at = (job.attempts < job.max_attempts).then(|| {
            let delay = retry_delay(job.backoff_base_ms, job.attempts);
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
        });

        let failed = FailedAttempt {
            reason: failure.message.clone(),
            stacktrace: failure.stack.clone(),
            result: result.to_value(),
            retry_at,
        };

        match store.fail(&job.id, worker_id, job.attempts, failed).await {
            Ok(Some(JobState::Delayed)) => warn!(
                job_id = %job.id,
                queue = %queue,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                error = %failure.message,
                "job failed, retry scheduled"
            ),
            Ok(Some(state)) => error!(
                job_id = %job.id,
                queue = %queue,
                attempt = job.attempts,
                %state,
                error = %failure.message,
                "job failed"
            ),
            Ok(None) => warn!(job_id = %job.id, queue = %queue, "lease lost, failure discarded"),
            Err(e) => error!(job_id = %job.id, queue = %queue, phase = "fail", error = %e, "failed to record failure"),
        }
    }
}
