//! Storage abstraction for job records.
//!
//! The store is the single source of truth for job state. Two
//! implementations exist:
//! - [`PostgresJobStore`](crate::kernel::store::PostgresJobStore) - durable, shared across processes
//! - [`MemoryJobStore`](crate::kernel::store::MemoryJobStore) - process-local, for tests and local runs
//!
//! Both enforce the same invariants:
//! - One record per id (`insert` reports [`StoreError::Conflict`] on duplicates)
//! - Claims are exclusive (a job is handed to one worker at a time)
//! - Only the current claim can move an `active` job to a terminal state,
//!   and terminal states never change again. A claim is fenced by the
//!   worker id together with the attempt number it started, so a run whose
//!   lease lapsed and was reclaimed cannot write over its successor

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::error::StoreError;
use super::job::{FailedAttempt, JobRecord, JobState, JobSummary, NewJob, QueueName, StateCounts};

/// Result of a bounded liveness check against the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityProbe {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectivityProbe {
    pub fn up(latency: Duration) -> Self {
        Self {
            ok: true,
            latency_ms: Some(latency.as_millis() as u64),
            error: None,
        }
    }

    pub fn down(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            latency_ms: None,
            error: Some(error.into()),
        }
    }
}

/// What a retention sweep removed or finalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: u64,
    /// Active jobs whose lease expired after their final attempt
    pub stalled_failed: u64,
}

/// Cutoffs for a retention sweep. Terminal jobs finished before the cutoff are deleted.
#[derive(Debug, Clone, Copy)]
pub struct RetentionCutoffs {
    pub completed_before: DateTime<Utc>,
    pub failed_before: DateTime<Utc>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job and return its initial state.
    ///
    /// The initial state is `delayed` when `run_at` is in the future, `paused`
    /// when the queue is paused, otherwise `waiting`.
    async fn insert(&self, job: NewJob) -> Result<JobState, StoreError>;

    /// Look up a job in one queue.
    async fn find(&self, queue: QueueName, id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Claim the next eligible job in a queue for `worker_id`.
    ///
    /// Eligible: `waiting`, `delayed` with `run_at <= now`, or `active` with an
    /// expired lease and attempts remaining. Nothing is claimed while the
    /// queue is paused. The claim moves the job to `active`, increments
    /// `attempts`, stamps `processed_at` and takes a lease.
    async fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>, StoreError>;

    /// Extend the lease for a running job (heartbeat).
    ///
    /// `attempt` is the `attempts` value returned by the claim; it fences
    /// this and the finishing calls below against a later reclaim.
    async fn extend_lease(
        &self,
        id: &str,
        worker_id: &str,
        attempt: i32,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// Move an active job held by this claim to `completed`.
    async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        attempt: i32,
        result: Value,
    ) -> Result<bool, StoreError>;

    /// Record a failed attempt. Returns the new state (`delayed` for a
    /// scheduled retry, `failed` when terminal) or `None` if the job is no
    /// longer held by this claim.
    async fn fail(
        &self,
        id: &str,
        worker_id: &str,
        attempt: i32,
        failed: FailedAttempt,
    ) -> Result<Option<JobState>, StoreError>;

    /// Toggle the queue-level admission hold. Returns how many jobs moved
    /// between `waiting` and `paused`.
    async fn set_paused(&self, queue: QueueName, paused: bool) -> Result<u64, StoreError>;

    async fn is_paused(&self, queue: QueueName) -> Result<bool, StoreError>;

    async fn counts(&self, queue: QueueName) -> Result<StateCounts, StoreError>;

    /// Non-terminal jobs in a queue, oldest first.
    async fn list_in_flight(
        &self,
        queue: QueueName,
        limit: i64,
    ) -> Result<Vec<JobSummary>, StoreError>;

    /// Delete terminal jobs past retention and fail stalled jobs that have
    /// no attempts left.
    async fn sweep(
        &self,
        queue: QueueName,
        cutoffs: RetentionCutoffs,
    ) -> Result<SweepReport, StoreError>;

    /// Bounded liveness check. Never blocks on connection establishment.
    async fn probe(&self) -> ConnectivityProbe;
}
