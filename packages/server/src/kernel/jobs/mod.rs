//! Job dispatch and status polling.
//!
//! This module provides the kernel-level infrastructure for tutor jobs:
//! - [`QueueRouter`] - Named queues (`interactive`, `background`) over one [`JobStore`]
//! - [`Enqueuer`] - Idempotent submission keyed by a deterministic job id
//! - [`StatusResolver`] - Cache-first status lookups with poll backoff hints
//! - [`WorkerPool`] - Claims jobs and runs them through the [`JobProcessor`]
//! - [`RetentionSweeper`] - Removes terminal jobs past retention
//!
//! # Architecture
//!
//! ```text
//! POST /jobs
//!     │
//!     └─► JobPayload::parse ─► derive_job_id ─► Enqueuer.enqueue()
//!             └─► JobStore.insert (conflict = already queued)
//!
//! WorkerPool (one per queue)
//!     │
//!     ├─► JobStore.claim (exclusive, leased)
//!     ├─► JobProcessor.process ─► JobHandlers.<kind>()
//!     └─► complete / retry as delayed / fail
//!
//! GET /jobs?id=
//!     │
//!     └─► StatusResolver.resolve()
//!             ├─► ResultCache (fresh hit returns immediately)
//!             ├─► JobStore.find (interactive, then background)
//!             └─► MissingTracker (not_found ─► gone)
//! ```

pub mod backoff;
pub mod cache;
mod enqueuer;
mod error;
mod job;
mod processor;
mod resolver;
mod router;
mod store;
mod sweeper;
pub mod testing;
mod worker;

pub use backoff::{retry_after_secs, retry_delay, PollHints};
pub use cache::{CacheEntry, CacheLookup, MissVerdict, MissingTracker, ResultCache};
pub use enqueuer::{EnqueueOptions, EnqueueOutcome, Enqueuer};
pub use error::{JobsError, StoreError, ValidationError};
pub use job::{
    unwrap_result_envelope, AskPayload, AskResult, BackfillResult, ChatTurn,
    ContentBackfillPayload, FailedAttempt, FailureInfo, IgnoredInfo, JobKind, JobPayload,
    JobRecord, JobState, JobSummary, LessonPlanPayload, LessonPlanResult, NewJob,
    PreflightResult, QueueName, QueueState, ResultMeta, StateCounts, TutorPreflightPayload,
    WorkerResult,
};
pub use processor::{Handled, JobHandlers, JobProcessor};
pub use resolver::{
    CacheSource, JobDebug, JobView, QueueDiagnostics, QueueListing, Resolution, StatusResolver,
    StoreDiagnostics,
};
pub use router::{QueueHandle, QueueRouter, QueueSettings};
pub use store::{ConnectivityProbe, JobStore, RetentionCutoffs, SweepReport};
pub use sweeper::RetentionSweeper;
pub use worker::{WorkerPool, WorkerPoolConfig};
