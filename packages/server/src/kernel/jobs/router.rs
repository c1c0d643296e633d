//! Named queue handles over a shared job store.
//!
//! Handles are created on first use and memoized, so every caller asking
//! for the same queue gets the same [`QueueHandle`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use super::error::{JobsError, StoreError};
use super::job::{JobRecord, QueueName, StateCounts};
use super::store::{JobStore, RetentionCutoffs};
use crate::config::QueueConfig;

/// Per-queue execution and retention settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    /// Jobs processed in parallel by one worker pool
    pub concurrency: usize,
    pub max_attempts: i32,
    /// First retry delay; doubles on each further attempt
    pub backoff_base: Duration,
    pub retention_completed: Duration,
    pub retention_failed: Duration,
    /// How long a claim stays valid without a heartbeat
    pub lease_duration: Duration,
}

impl QueueSettings {
    pub fn interactive() -> Self {
        Self {
            concurrency: 8,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            retention_completed: Duration::from_secs(60 * 60),
            retention_failed: Duration::from_secs(7 * 24 * 60 * 60),
            lease_duration: Duration::from_secs(30),
        }
    }

    pub fn background() -> Self {
        Self {
            concurrency: 1,
            backoff_base: Duration::from_secs(5),
            lease_duration: Duration::from_secs(5 * 60),
            ..Self::interactive()
        }
    }

    pub fn for_queue(queue: QueueName, config: &QueueConfig) -> Self {
        let defaults = match queue {
            QueueName::Interactive => Self::interactive(),
            QueueName::Background => Self::background(),
        };
        let concurrency = match queue {
            QueueName::Interactive => config.interactive_concurrency,
            QueueName::Background => config.background_concurrency,
        };

        Self {
            concurrency: concurrency.max(1),
            max_attempts: config.max_attempts.max(1),
            retention_completed: config.retention_completed,
            retention_failed: config.retention_failed,
            ..defaults
        }
    }
}

/// One logical queue: a name, its settings and the store behind it.
pub struct QueueHandle {
    name: QueueName,
    settings: QueueSettings,
    store: Arc<dyn JobStore>,
}

impl fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandle")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl QueueHandle {
    pub fn name(&self) -> QueueName {
        self.name
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub async fn find(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.store.find(self.name, id).await
    }

    pub async fn counts(&self) -> Result<StateCounts, StoreError> {
        self.store.counts(self.name).await
    }

    /// Hold new work: submissions land in `paused` and nothing is claimed.
    pub async fn pause(&self) -> Result<u64, StoreError> {
        let moved = self.store.set_paused(self.name, true).await?;
        info!(queue = %self.name, moved, "queue paused");
        Ok(moved)
    }

    pub async fn resume(&self) -> Result<u64, StoreError> {
        let moved = self.store.set_paused(self.name, false).await?;
        info!(queue = %self.name, moved, "queue resumed");
        Ok(moved)
    }

    pub async fn is_paused(&self) -> Result<bool, StoreError> {
        self.store.is_paused(self.name).await
    }

    /// Retention cutoffs relative to now.
    pub fn retention_cutoffs(&self) -> RetentionCutoffs {
        let now = Utc::now();
        RetentionCutoffs {
            completed_before: cutoff(now, self.settings.retention_completed),
            failed_before: cutoff(now, self.settings.retention_failed),
        }
    }
}

fn cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub struct QueueRouter {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    handles: Mutex<HashMap<QueueName, Arc<QueueHandle>>>,
}

impl QueueRouter {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a queue by name. Unknown names are an error.
    pub fn resolve(&self, name: &str) -> Result<Arc<QueueHandle>, JobsError> {
        let queue = QueueName::from_str(name)?;
        Ok(self.queue(queue))
    }

    pub fn queue(&self, name: QueueName) -> Arc<QueueHandle> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles
            .entry(name)
            .or_insert_with(|| {
                Arc::new(QueueHandle {
                    name,
                    settings: QueueSettings::for_queue(name, &self.config),
                    store: self.store.clone(),
                })
            })
            .clone()
    }

    /// Every queue, in status-probe order.
    pub fn all(&self) -> Vec<Arc<QueueHandle>> {
        QueueName::ALL.iter().map(|name| self.queue(*name)).collect()
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }
}
