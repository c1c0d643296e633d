//! In-memory job store.
//!
//! Mirrors the PostgreSQL store's semantics behind a single mutex, so every
//! operation is atomic. Used by tests and by `JOB_STORE=memory` local runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::kernel::jobs::{
    ConnectivityProbe, FailedAttempt, JobRecord, JobState, JobStore, JobSummary, NewJob, QueueName,
    RetentionCutoffs, StateCounts, StoreError, SweepReport,
};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<String, JobRecord>,
    paused: HashSet<QueueName>,
}

/// Process-local job store.
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Simulate the store becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every store call (except `probe`) by `latency`, like a store
    /// that accepts connections but answers slowly.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of records across all queues.
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a record outright, as if retention had swept it.
    pub fn evict(&self, id: &str) -> bool {
        self.lock().jobs.remove(id).is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.check_available()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        }
    }
}

/// The job is active under exactly this claim.
fn held_by(job: &JobRecord, worker_id: &str, attempt: i32) -> bool {
    job.state == JobState::Active
        && job.attempts == attempt
        && job.worker_id.as_deref() == Some(worker_id)
}

fn lease_deadline(lease: Duration) -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::milliseconds(lease.as_millis() as i64)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: NewJob) -> Result<JobState, StoreError> {
        self.enter().await?;
        let mut state = self.lock();

        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(job.id));
        }

        let now = Utc::now();
        let initial = match job.run_at {
            Some(run_at) if run_at > now => JobState::Delayed,
            _ if state.paused.contains(&job.queue_name) => JobState::Paused,
            _ => JobState::Waiting,
        };

        let record = JobRecord {
            id: job.id.clone(),
            queue_name: job.queue_name,
            job_type: job.job_type,
            payload: job.payload,
            state: initial,
            progress: 0,
            attempts: 0,
            max_attempts: job.max_attempts,
            backoff_base_ms: job.backoff_base_ms,
            run_at: job.run_at,
            created_at: now,
            processed_at: None,
            finished_at: None,
            result: None,
            failed_reason: None,
            stacktrace: None,
            worker_id: None,
            lease_expires_at: None,
        };
        state.jobs.insert(job.id, record);

        Ok(initial)
    }

    async fn find(&self, queue: QueueName, id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.enter().await?;
        Ok(self
            .lock()
            .jobs
            .get(id)
            .filter(|job| job.queue_name == queue)
            .cloned())
    }

    async fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>, StoreError> {
        self.enter().await?;
        let mut state = self.lock();

        if state.paused.contains(&queue) {
            return Ok(None);
        }

        let now = Utc::now();
        let next_id = state
            .jobs
            .values()
            .filter(|job| job.queue_name == queue)
            .filter(|job| match job.state {
                JobState::Waiting => true,
                JobState::Delayed => job.run_at.map_or(true, |run_at| run_at <= now),
                JobState::Active => {
                    job.attempts < job.max_attempts
                        && job.lease_expires_at.is_some_and(|expires| expires < now)
                }
                _ => false,
            })
            .min_by_key(|job| job.run_at.unwrap_or(job.created_at))
            .map(|job| job.id.clone());

        let Some(id) = next_id else {
            return Ok(None);
        };

        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.attempts += 1;
        job.progress = 0;
        job.processed_at = Some(now);
        job.worker_id = Some(worker_id.to_string());
        job.lease_expires_at = Some(lease_deadline(lease));

        Ok(Some(job.clone()))
    }

    async fn extend_lease(
        &self,
        id: &str,
        worker_id: &str,
        attempt: i32,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        self.enter().await?;
        let mut state = self.lock();

        match state.jobs.get_mut(id) {
            Some(job) if held_by(job, worker_id, attempt) => {
                job.lease_expires_at = Some(lease_deadline(lease));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        attempt: i32,
        result: Value,
    ) -> Result<bool, StoreError> {
        self.enter().await?;
        let mut state = self.lock();

        match state.jobs.get_mut(id) {
            Some(job) if held_by(job, worker_id, attempt) => {
                job.state = JobState::Completed;
                job.progress = 100;
                job.result = Some(result);
                job.finished_at = Some(Utc::now());
                job.worker_id = None;
                job.lease_expires_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(
        &self,
        id: &str,
        worker_id: &str,
        attempt: i32,
        failed: FailedAttempt,
    ) -> Result<Option<JobState>, StoreError> {
        self.enter().await?;
        let mut state = self.lock();

        let Some(job) = state.jobs.get_mut(id) else {
            return Ok(None);
        };
        if !held_by(job, worker_id, attempt) {
            return Ok(None);
        }

        job.failed_reason = Some(failed.reason);
        job.stacktrace = failed.stacktrace;
        job.worker_id = None;
        job.lease_expires_at = None;

        match failed.retry_at {
            Some(retry_at) => {
                job.state = JobState::Delayed;
                job.run_at = Some(retry_at);
            }
            None => {
                job.state = JobState::Failed;
                job.result = Some(failed.result);
                job.finished_at = Some(Utc::now());
            }
        }

        Ok(Some(job.state))
    }

    async fn set_paused(&self, queue: QueueName, paused: bool) -> Result<u64, StoreError> {
        self.enter().await?;
        let mut state = self.lock();

        let (from, to) = if paused {
            state.paused.insert(queue);
            (JobState::Waiting, JobState::Paused)
        } else {
            state.paused.remove(&queue);
            (JobState::Paused, JobState::Waiting)
        };

        let mut moved = 0;
        for job in state.jobs.values_mut() {
            if job.queue_name == queue && job.state == from {
                job.state = to;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn is_paused(&self, queue: QueueName) -> Result<bool, StoreError> {
        self.enter().await?;
        Ok(self.lock().paused.contains(&queue))
    }

    async fn counts(&self, queue: QueueName) -> Result<StateCounts, StoreError> {
        self.enter().await?;
        let state = self.lock();

        let mut counts = StateCounts::default();
        for job in state.jobs.values().filter(|job| job.queue_name == queue) {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn list_in_flight(
        &self,
        queue: QueueName,
        limit: i64,
    ) -> Result<Vec<JobSummary>, StoreError> {
        self.enter().await?;
        let state = self.lock();

        let mut jobs: Vec<&JobRecord> = state
            .jobs
            .values()
            .filter(|job| job.queue_name == queue && !job.state.is_terminal())
            .collect();
        jobs.sort_by_key(|job| job.created_at);

        Ok(jobs
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|job| JobSummary {
                id: job.id.clone(),
                job_type: job.job_type.clone(),
                state: job.state,
                attempts: job.attempts,
                created_at: job.created_at,
            })
            .collect())
    }

    async fn sweep(
        &self,
        queue: QueueName,
        cutoffs: RetentionCutoffs,
    ) -> Result<SweepReport, StoreError> {
        self.enter().await?;
        let mut state = self.lock();
        let now = Utc::now();
        let mut report = SweepReport::default();

        for job in state.jobs.values_mut() {
            if job.queue_name == queue
                && job.state == JobState::Active
                && job.attempts >= job.max_attempts
                && job.lease_expires_at.is_some_and(|expires| expires < now)
            {
                job.state = JobState::Failed;
                job.failed_reason = Some("job stalled: lease expired after final attempt".into());
                job.finished_at = Some(now);
                job.worker_id = None;
                job.lease_expires_at = None;
                report.stalled_failed += 1;
            }
        }

        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            if job.queue_name != queue {
                return true;
            }
            match (job.state, job.finished_at) {
                (JobState::Completed, Some(done)) => done >= cutoffs.completed_before,
                (JobState::Failed, Some(done)) => done >= cutoffs.failed_before,
                _ => true,
            }
        });
        report.removed = (before - state.jobs.len()) as u64;

        Ok(report)
    }

    async fn probe(&self) -> ConnectivityProbe {
        match self.check_available() {
            Ok(()) => ConnectivityProbe::up(Duration::ZERO),
            Err(e) => ConnectivityProbe::down(e.to_string()),
        }
    }
}
