//! Status lookups for polling clients.
//!
//! Resolution order for an id:
//! 1. Result cache: a fresh entry answers without touching the store
//! 2. Store: interactive queue first, then background
//! 3. Not found anywhere: the missing-record tracker decides between
//!    `not_found` (keep polling) and `gone` (stop)
//!
//! A stale cache entry is served only when the store cannot answer or the
//! record has since been swept by retention.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::backoff::PollHints;
use super::cache::{CacheLookup, MissVerdict, MissingTracker, ResultCache};
use super::error::StoreError;
use super::job::{unwrap_result_envelope, JobRecord, JobState, JobSummary, QueueName, QueueState, StateCounts};
use super::router::{QueueHandle, QueueRouter};
use super::store::ConnectivityProbe;

/// Where a status answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    Fresh,
    Stale,
    Store,
}

/// How long diagnostics may spend collecting per-queue counts.
pub const DEFAULT_DIAGNOSTICS_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-queue counts for diagnostics. Fields are `None` when the store could
/// not provide them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDiagnostics {
    pub queue: QueueName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<StateCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueueDiagnostics {
    fn missing(queue: QueueName, error: String) -> Self {
        Self {
            queue,
            counts: None,
            paused: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreDiagnostics {
    pub queues: Vec<QueueDiagnostics>,
    pub store: ConnectivityProbe,
}

/// In-flight jobs of one queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueListing {
    pub queue: QueueName,
    pub jobs: Vec<JobSummary>,
}

/// Extra detail returned to operators with `debug=1`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDebug {
    pub queue: QueueName,
    pub job_type: String,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Options the job was enqueued with
    pub options: Value,
    pub source: CacheSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StoreDiagnostics>,
}

/// A job as a polling client sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobView {
    pub job_id: String,
    pub queue: QueueName,
    pub state: QueueState,
    pub progress: i32,
    /// `None` once the job is terminal
    pub retry_after: Option<Duration>,
    /// Handler output, unwrapped from the stored envelope
    pub result: Option<Value>,
    pub error: Option<String>,
    pub source: CacheSource,
    pub debug: Option<JobDebug>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(JobView),
    NotFound {
        job_id: String,
        retry_after: Duration,
        hits: u32,
    },
    Gone {
        job_id: String,
        hits: u32,
    },
    /// The store could not be reached and nothing usable was cached
    Unavailable {
        job_id: String,
        retry_after: Duration,
        error: String,
        diagnostics: StoreDiagnostics,
    },
}

impl Resolution {
    pub fn state(&self) -> QueueState {
        match self {
            Resolution::Found(view) => view.state,
            Resolution::NotFound { .. } => QueueState::NotFound,
            Resolution::Gone { .. } => QueueState::Gone,
            Resolution::Unavailable { .. } => QueueState::Unknown,
        }
    }
}

pub struct StatusResolver {
    router: Arc<QueueRouter>,
    cache: ResultCache<JobRecord>,
    missing: MissingTracker,
    hints: PollHints,
    diagnostics_timeout: Duration,
}

impl StatusResolver {
    pub fn new(router: Arc<QueueRouter>, cache: ResultCache<JobRecord>, missing: MissingTracker) -> Self {
        Self {
            router,
            cache,
            missing,
            hints: PollHints::default(),
            diagnostics_timeout: DEFAULT_DIAGNOSTICS_TIMEOUT,
        }
    }

    pub fn with_hints(mut self, hints: PollHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_diagnostics_timeout(mut self, timeout: Duration) -> Self {
        self.diagnostics_timeout = timeout;
        self
    }

    /// Resolve the current status of a job.
    ///
    /// Errors only for store failures other than unavailability (bad query,
    /// undecodable row); an unreachable store yields [`Resolution::Unavailable`].
    pub async fn resolve(&self, job_id: &str, debug: bool) -> Result<Resolution, StoreError> {
        let stale = match self.cache.get_at(job_id, Instant::now()) {
            CacheLookup::Fresh(record) => {
                debug!(job_id, "status served from cache");
                return Ok(Resolution::Found(
                    self.view(&record, CacheSource::Fresh, debug).await,
                ));
            }
            CacheLookup::Stale(record) => Some(record),
            CacheLookup::Miss => None,
        };

        match self.lookup(job_id).await {
            Ok(Some(record)) => {
                self.missing.forget(job_id);
                if record.state.is_terminal() {
                    self.cache.put(job_id, record.clone());
                }
                Ok(Resolution::Found(
                    self.view(&record, CacheSource::Store, debug).await,
                ))
            }
            Ok(None) => {
                if let Some(record) = stale {
                    debug!(job_id, "record swept, serving cached result");
                    return Ok(Resolution::Found(
                        self.view(&record, CacheSource::Stale, debug).await,
                    ));
                }

                match self.missing.record_miss(job_id) {
                    MissVerdict::NotFound { hits } => Ok(Resolution::NotFound {
                        job_id: job_id.to_string(),
                        retry_after: self.hints.unknown,
                        hits,
                    }),
                    MissVerdict::Gone { hits } => {
                        debug!(job_id, hits, "missing job escalated to gone");
                        Ok(Resolution::Gone {
                            job_id: job_id.to_string(),
                            hits,
                        })
                    }
                }
            }
            Err(e) if e.is_unavailable() => {
                if let Some(record) = stale {
                    warn!(job_id, error = %e, "store unavailable, serving stale result");
                    return Ok(Resolution::Found(
                        self.view(&record, CacheSource::Stale, debug).await,
                    ));
                }

                warn!(job_id, phase = "status", error = %e, "store unavailable");
                Ok(Resolution::Unavailable {
                    job_id: job_id.to_string(),
                    retry_after: self.hints.unknown,
                    error: e.to_string(),
                    diagnostics: self.diagnostics().await,
                })
            }
            Err(e) => {
                if let Some(record) = stale {
                    warn!(job_id, error = %e, "store lookup failed, serving stale result");
                    return Ok(Resolution::Found(
                        self.view(&record, CacheSource::Stale, debug).await,
                    ));
                }
                Err(e)
            }
        }
    }

    /// Per-queue state counts plus a store liveness probe. Never fails;
    /// whatever could not be collected is reported inline.
    ///
    /// Counts are skipped when the probe fails and are otherwise collected
    /// for all queues at once under `diagnostics_timeout`, so an outage
    /// answer stays well inside the request timeout.
    pub async fn diagnostics(&self) -> StoreDiagnostics {
        let store = self.router.store().probe().await;
        let handles = self.router.all();

        if !store.ok {
            let reason = format!(
                "skipped: {}",
                store.error.as_deref().unwrap_or("store unreachable")
            );
            return StoreDiagnostics {
                queues: handles
                    .iter()
                    .map(|queue| QueueDiagnostics::missing(queue.name(), reason.clone()))
                    .collect(),
                store,
            };
        }

        let collected = tokio::time::timeout(
            self.diagnostics_timeout,
            futures::future::join_all(handles.iter().map(|queue| queue_diagnostics(queue))),
        )
        .await;

        let queues = match collected {
            Ok(queues) => queues,
            Err(_) => {
                warn!(
                    timeout_ms = self.diagnostics_timeout.as_millis() as u64,
                    "queue diagnostics timed out"
                );
                let reason = format!("timed out after {}ms", self.diagnostics_timeout.as_millis());
                handles
                    .iter()
                    .map(|queue| QueueDiagnostics::missing(queue.name(), reason.clone()))
                    .collect()
            }
        };

        StoreDiagnostics { queues, store }
    }

    /// Non-terminal jobs per queue, oldest first.
    pub async fn in_flight(&self, limit: i64) -> Result<Vec<QueueListing>, StoreError> {
        let mut listings = Vec::new();
        for queue in self.router.all() {
            let jobs = queue.store().list_in_flight(queue.name(), limit).await?;
            listings.push(QueueListing {
                queue: queue.name(),
                jobs,
            });
        }
        Ok(listings)
    }

    async fn lookup(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        for queue in self.router.all() {
            if let Some(record) = queue.find(job_id).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn view(&self, record: &JobRecord, source: CacheSource, with_debug: bool) -> JobView {
        let state = QueueState::from(record.state);

        let (result, error) = match record.state {
            JobState::Completed => (record.result.as_ref().map(unwrap_result_envelope), None),
            JobState::Failed => (
                None,
                Some(
                    record
                        .failed_reason
                        .clone()
                        .unwrap_or_else(|| "job failed".to_string()),
                ),
            ),
            _ => (None, None),
        };

        let debug = if with_debug {
            Some(JobDebug {
                queue: record.queue_name,
                job_type: record.job_type.clone(),
                attempts: record.attempts,
                created_at: record.created_at,
                processed_at: record.processed_at,
                finished_at: record.finished_at,
                options: json!({
                    "maxAttempts": record.max_attempts,
                    "backoffBaseMs": record.backoff_base_ms,
                    "runAt": record.run_at,
                }),
                source,
                failed_reason: record.failed_reason.clone(),
                stacktrace: record.stacktrace.clone(),
                // A fresh cache hit answers without the store
                stats: match source {
                    CacheSource::Fresh => None,
                    CacheSource::Stale | CacheSource::Store => Some(self.diagnostics().await),
                },
            })
        } else {
            None
        };

        JobView {
            job_id: record.id.clone(),
            queue: record.queue_name,
            state,
            progress: record.progress,
            retry_after: self.hints.for_state(state, record.run_at, Utc::now()),
            result,
            error,
            source,
            debug,
        }
    }
}

async fn queue_diagnostics(queue: &QueueHandle) -> QueueDiagnostics {
    let (counts, paused) = tokio::join!(queue.counts(), queue.is_paused());
    let error = counts
        .as_ref()
        .err()
        .or(paused.as_ref().err())
        .map(|e| e.to_string());

    QueueDiagnostics {
        queue: queue.name(),
        counts: counts.ok(),
        paused: paused.ok(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::kernel::jobs::{FailedAttempt, JobStore, NewJob, WorkerResult};
    use crate::kernel::store::MemoryJobStore;

    struct Fixture {
        store: Arc<MemoryJobStore>,
        resolver: StatusResolver,
    }

    fn fixture(threshold: u32) -> Fixture {
        let store = Arc::new(MemoryJobStore::new());
        let router = Arc::new(QueueRouter::new(store.clone(), QueueConfig::default()));
        let resolver = StatusResolver::new(
            router,
            ResultCache::new(Duration::from_secs(30), Duration::from_secs(600), 100),
            MissingTracker::new(Duration::from_secs(120), threshold),
        );
        Fixture { store, resolver }
    }

    async fn insert(store: &MemoryJobStore, id: &str, queue: QueueName) {
        store
            .insert(
                NewJob::builder()
                    .id(id)
                    .queue_name(queue)
                    .job_type("ask")
                    .payload(json!({"prompt": "hi"}))
                    .build(),
            )
            .await
            .unwrap();
    }

    async fn complete(store: &MemoryJobStore, id: &str, queue: QueueName, answer: &str) {
        insert(store, id, queue).await;
        let claimed = store
            .claim(queue, "w1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let result = WorkerResult::Ask {
            result: crate::kernel::jobs::AskResult {
                answer: answer.to_string(),
            },
            meta: Default::default(),
        };
        assert!(store
            .complete(&claimed.id, "w1", claimed.attempts, result.to_value())
            .await
            .unwrap());
    }

    fn found(resolution: Resolution) -> JobView {
        match resolution {
            Resolution::Found(view) => view,
            other => panic!("expected found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn waiting_job_has_poll_hint() {
        let f = fixture(5);
        insert(&f.store, "j1", QueueName::Interactive).await;

        let view = found(f.resolver.resolve("j1", false).await.unwrap());
        assert_eq!(view.state, QueueState::Waiting);
        assert_eq!(view.retry_after, Some(Duration::from_secs(3)));
        assert_eq!(view.source, CacheSource::Store);
        assert!(view.debug.is_none());
    }

    #[tokio::test]
    async fn background_jobs_are_found_after_interactive_miss() {
        let f = fixture(5);
        insert(&f.store, "bg", QueueName::Background).await;

        let view = found(f.resolver.resolve("bg", false).await.unwrap());
        assert_eq!(view.queue, QueueName::Background);
    }

    #[tokio::test]
    async fn completed_result_is_unwrapped_and_cached() {
        let f = fixture(5);
        complete(&f.store, "done", QueueName::Interactive, "42").await;

        let view = found(f.resolver.resolve("done", false).await.unwrap());
        assert_eq!(view.state, QueueState::Completed);
        assert_eq!(view.result, Some(json!({"answer": "42"})));
        assert_eq!(view.retry_after, None);

        // A fresh cache hit must not need the store at all
        f.store.set_available(false);
        let cached = found(f.resolver.resolve("done", false).await.unwrap());
        assert_eq!(cached.source, CacheSource::Fresh);
        assert_eq!(cached.result, Some(json!({"answer": "42"})));
    }

    #[tokio::test]
    async fn swept_record_serves_stale_entry() {
        let f = fixture(5);
        complete(&f.store, "done", QueueName::Interactive, "42").await;
        f.resolver.resolve("done", false).await.unwrap();

        // Age the cache entry past its soft TTL
        let record = f.store.find(QueueName::Interactive, "done").await.unwrap().unwrap();
        f.resolver
            .cache
            .put_at("done", record, Instant::now() - Duration::from_secs(60));
        f.store.evict("done");

        let view = found(f.resolver.resolve("done", false).await.unwrap());
        assert_eq!(view.source, CacheSource::Stale);
        assert_eq!(view.state, QueueState::Completed);
    }

    #[tokio::test]
    async fn failed_job_surfaces_reason() {
        let f = fixture(5);
        insert(&f.store, "bad", QueueName::Interactive).await;
        f.store
            .claim(QueueName::Interactive, "w1", Duration::from_secs(30))
            .await
            .unwrap();
        f.store
            .fail(
                "bad",
                "w1",
                1,
                FailedAttempt {
                    reason: "model refused".into(),
                    stacktrace: None,
                    result: WorkerResult::failure("model refused", None).to_value(),
                    retry_at: None,
                },
            )
            .await
            .unwrap();

        let view = found(f.resolver.resolve("bad", true).await.unwrap());
        assert_eq!(view.state, QueueState::Failed);
        assert_eq!(view.error.as_deref(), Some("model refused"));
        let debug = view.debug.unwrap();
        assert_eq!(debug.attempts, 1);
        assert!(debug.stats.is_some());
    }

    #[tokio::test]
    async fn missing_escalates_to_gone_at_threshold() {
        let f = fixture(3);

        for expected in 1..=2 {
            match f.resolver.resolve("ghost", false).await.unwrap() {
                Resolution::NotFound { hits, retry_after, .. } => {
                    assert_eq!(hits, expected);
                    assert_eq!(retry_after, Duration::from_secs(8));
                }
                other => panic!("expected not found, got {other:?}"),
            }
        }

        let third = f.resolver.resolve("ghost", false).await.unwrap();
        assert!(matches!(third, Resolution::Gone { hits: 3, .. }));
        assert_eq!(third.state(), QueueState::Gone);
    }

    #[tokio::test]
    async fn job_appearing_resets_missing_count() {
        let f = fixture(2);
        assert!(matches!(
            f.resolver.resolve("late", false).await.unwrap(),
            Resolution::NotFound { hits: 1, .. }
        ));

        insert(&f.store, "late", QueueName::Interactive).await;
        found(f.resolver.resolve("late", false).await.unwrap());

        f.store.evict("late");
        assert!(matches!(
            f.resolver.resolve("late", false).await.unwrap(),
            Resolution::NotFound { hits: 1, .. }
        ));
    }

    #[tokio::test]
    async fn outage_without_cache_is_unavailable() {
        let f = fixture(5);
        f.store.set_available(false);

        match f.resolver.resolve("any", false).await.unwrap() {
            Resolution::Unavailable { diagnostics, .. } => {
                assert_eq!(diagnostics.queues.len(), 2);
                assert!(diagnostics.queues.iter().all(|q| q.counts.is_none()));
                assert!(!diagnostics.store.ok);
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn outage_skips_queue_counts() {
        let f = fixture(5);
        f.store.set_available(false);

        let diagnostics = f.resolver.diagnostics().await;
        assert!(!diagnostics.store.ok);
        for queue in &diagnostics.queues {
            assert!(queue.error.as_deref().unwrap().starts_with("skipped"));
        }
    }

    #[tokio::test]
    async fn slow_store_diagnostics_are_bounded() {
        let f = fixture(5);
        f.store.set_latency(Duration::from_secs(5));
        let resolver = f
            .resolver
            .with_diagnostics_timeout(Duration::from_millis(50));

        let started = Instant::now();
        let diagnostics = resolver.diagnostics().await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(diagnostics.store.ok);
        assert_eq!(diagnostics.queues.len(), 2);
        for queue in &diagnostics.queues {
            assert!(queue.counts.is_none());
            assert!(queue.error.as_deref().unwrap().contains("timed out"));
        }
    }

    #[tokio::test]
    async fn fresh_debug_hit_skips_store_stats() {
        let f = fixture(5);
        complete(&f.store, "done", QueueName::Interactive, "42").await;
        f.resolver.resolve("done", false).await.unwrap();

        f.store.set_available(false);
        let view = found(f.resolver.resolve("done", true).await.unwrap());

        assert_eq!(view.source, CacheSource::Fresh);
        let debug = view.debug.unwrap();
        assert_eq!(debug.source, CacheSource::Fresh);
        assert!(debug.stats.is_none());
    }

    #[tokio::test]
    async fn in_flight_lists_per_queue() {
        let f = fixture(5);
        insert(&f.store, "a", QueueName::Interactive).await;
        insert(&f.store, "b", QueueName::Background).await;
        complete(&f.store, "c", QueueName::Interactive, "x").await;

        let listings = f.resolver.in_flight(50).await.unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].queue, QueueName::Interactive);
        assert_eq!(listings[0].jobs.len(), 1);
        assert_eq!(listings[1].jobs.len(), 1);
    }
}
