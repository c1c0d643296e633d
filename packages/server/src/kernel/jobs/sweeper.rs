//! Periodic retention sweep.
//!
//! ```text
//! RetentionSweeper (every `interval`)
//!     │
//!     └─► for each queue
//!             ├─► fail active jobs whose lease expired on the last attempt
//!             └─► delete completed / failed jobs past retention
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::router::QueueRouter;
use super::store::SweepReport;

pub struct RetentionSweeper {
    router: Arc<QueueRouter>,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(router: Arc<QueueRouter>, interval: Duration) -> Self {
        Self { router, interval }
    }

    /// One pass over every queue. Per-queue failures are logged and skipped.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut total = SweepReport::default();

        for queue in self.router.all() {
            match queue
                .store()
                .sweep(queue.name(), queue.retention_cutoffs())
                .await
            {
                Ok(report) => {
                    if report.removed > 0 || report.stalled_failed > 0 {
                        info!(
                            queue = %queue.name(),
                            removed = report.removed,
                            stalled_failed = report.stalled_failed,
                            "retention sweep"
                        );
                    }
                    total.removed += report.removed;
                    total.stalled_failed += report.stalled_failed;
                }
                Err(e) => {
                    error!(queue = %queue.name(), phase = "sweep", error = %e, "retention sweep failed");
                }
            }
        }

        total
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                }
            }

            debug!("retention sweeper stopped");
        })
    }
}
