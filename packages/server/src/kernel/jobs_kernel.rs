// JobsKernel - the job subsystem with all of its dependencies
//
// Built once at startup and shared with the HTTP layer. Owns the queue
// router, enqueuer, status resolver and processor, and starts the worker
// pools and retention sweeper on request.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::jobs::{
    EnqueueOptions, EnqueueOutcome, Enqueuer, JobHandlers, JobPayload, JobProcessor, JobStore,
    JobsError, MissingTracker, QueueListing, QueueName, QueueRouter, Resolution, ResultCache,
    RetentionSweeper, StatusResolver, StoreDiagnostics, StoreError, WorkerPool, WorkerPoolConfig,
};
use super::store::ConnectionManager;
use crate::config::{CacheConfig, PollConfig, QueueConfig};

/// Tunables for the job subsystem.
#[derive(Debug, Clone, Default)]
pub struct JobsSettings {
    pub queues: QueueConfig,
    pub cache: CacheConfig,
    pub poll: PollConfig,
}

pub struct JobsKernel {
    pub router: Arc<QueueRouter>,
    pub enqueuer: Enqueuer,
    pub resolver: StatusResolver,
    processor: Arc<JobProcessor>,
    settings: JobsSettings,
    connections: Option<Arc<ConnectionManager>>,
    shutdown: CancellationToken,
}

impl JobsKernel {
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: Arc<dyn JobHandlers>,
        settings: JobsSettings,
    ) -> Self {
        let router = Arc::new(QueueRouter::new(store, settings.queues.clone()));

        Self {
            enqueuer: Enqueuer::new(router.clone()),
            resolver: StatusResolver::new(
                router.clone(),
                ResultCache::from_config(&settings.cache),
                MissingTracker::from_config(&settings.poll),
            ),
            processor: Arc::new(JobProcessor::new(handlers)),
            router,
            settings,
            connections: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Attach the store connection so `close` can release it.
    pub fn with_connections(mut self, connections: Arc<ConnectionManager>) -> Self {
        self.connections = Some(connections);
        self
    }

    pub async fn submit(
        &self,
        payload: &JobPayload,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, JobsError> {
        self.enqueuer.submit(payload, options).await
    }

    pub async fn status(&self, job_id: &str, debug: bool) -> Result<Resolution, StoreError> {
        self.resolver.resolve(job_id, debug).await
    }

    pub async fn diagnostics(&self) -> StoreDiagnostics {
        self.resolver.diagnostics().await
    }

    pub async fn in_flight(&self, limit: i64) -> Result<Vec<QueueListing>, StoreError> {
        self.resolver.in_flight(limit).await
    }

    /// A worker pool for one queue, not yet started.
    pub fn worker_pool(&self, queue: QueueName) -> WorkerPool {
        WorkerPool::with_config(
            self.router.queue(queue),
            self.processor.clone(),
            WorkerPoolConfig::default(),
        )
    }

    /// Start one worker pool per queue and the retention sweeper.
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = QueueName::ALL
            .iter()
            .map(|queue| Arc::new(self.worker_pool(*queue)).spawn(self.shutdown.child_token()))
            .collect();

        let sweeper = RetentionSweeper::new(self.router.clone(), self.settings.queues.sweep_interval);
        handles.push(sweeper.spawn(self.shutdown.child_token()));

        info!(queues = QueueName::ALL.len(), "job workers started");
        handles
    }

    /// Signal workers and the sweeper to stop. In-flight jobs still finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stop workers and the sweeper, then release the store connection.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some(connections) = &self.connections {
            connections.close().await;
        }
    }
}
