//! PostgreSQL-backed job store.
//!
//! Every operation obtains the shared pool from the [`ConnectionManager`],
//! so the first store call in the process triggers connection setup.
//! Claims use `FOR UPDATE SKIP LOCKED` for concurrent-safe claiming across
//! worker processes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tracing::debug;

use super::connection::ConnectionManager;
use crate::kernel::jobs::{
    ConnectivityProbe, FailedAttempt, JobRecord, JobState, JobStore, JobSummary, NewJob, QueueName,
    RetentionCutoffs, StateCounts, StoreError, SweepReport,
};

const JOB_COLUMNS: &str = "id, queue_name, job_type, payload, state, progress, attempts, \
    max_attempts, backoff_base_ms, run_at, created_at, processed_at, finished_at, result, \
    failed_reason, stacktrace, worker_id, lease_expires_at";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn lease_ms(lease: Duration) -> i64 {
    lease.as_millis() as i64
}

pub struct PostgresJobStore {
    connections: Arc<ConnectionManager>,
}

impl PostgresJobStore {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    async fn pool(&self) -> Result<PgPool, StoreError> {
        self.connections.get_connection().await
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: NewJob) -> Result<JobState, StoreError> {
        let pool = self.pool().await?;

        let inserted = sqlx::query_scalar::<_, JobState>(
            r#"
            INSERT INTO jobs (id, queue_name, job_type, payload, state, max_attempts, backoff_base_ms, run_at)
            VALUES (
                $1, $2, $3, $4,
                CASE
                    WHEN $7::timestamptz IS NOT NULL AND $7::timestamptz > NOW() THEN 'delayed'::job_state
                    WHEN EXISTS (SELECT 1 FROM queue_controls qc WHERE qc.queue_name = $2 AND qc.paused) THEN 'paused'::job_state
                    ELSE 'waiting'::job_state
                END,
                $5, $6, $7
            )
            RETURNING state
            "#,
        )
        .bind(&job.id)
        .bind(job.queue_name)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.max_attempts)
        .bind(job.backoff_base_ms)
        .bind(job.run_at)
        .fetch_one(&pool)
        .await;

        match inserted {
            Ok(state) => Ok(state),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(job.id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn find(&self, queue: QueueName, id: &str) -> Result<Option<JobRecord>, StoreError> {
        let pool = self.pool().await?;

        let job = sqlx::query_as::<_, JobRecord>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND queue_name = $2"
        ))
        .bind(id)
        .bind(queue)
        .fetch_optional(&pool)
        .await?;

        Ok(job)
    }

    async fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<JobRecord>, StoreError> {
        let pool = self.pool().await?;

        let job = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE queue_name = $1
                  AND (
                      state = 'waiting'
                      OR (state = 'delayed' AND (run_at IS NULL OR run_at <= NOW()))
                      OR (state = 'active' AND lease_expires_at < NOW() AND attempts < max_attempts)
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM queue_controls qc WHERE qc.queue_name = $1 AND qc.paused
                  )
                ORDER BY COALESCE(run_at, created_at)
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET
                state = 'active',
                attempts = attempts + 1,
                progress = 0,
                processed_at = NOW(),
                worker_id = $2,
                lease_expires_at = NOW() + ($3::bigint * INTERVAL '1 millisecond')
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(worker_id)
        .bind(lease_ms(lease))
        .fetch_optional(&pool)
        .await?;

        Ok(job)
    }

    async fn extend_lease(
        &self,
        id: &str,
        worker_id: &str,
        attempt: i32,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let pool = self.pool().await?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + ($4::bigint * INTERVAL '1 millisecond')
            WHERE id = $1 AND worker_id = $2 AND attempts = $3 AND state = 'active'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(attempt)
        .bind(lease_ms(lease))
        .execute(&pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        attempt: i32,
        result: Value,
    ) -> Result<bool, StoreError> {
        let pool = self.pool().await?;

        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed',
                progress = 100,
                result = $4,
                finished_at = NOW(),
                worker_id = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND worker_id = $2 AND attempts = $3 AND state = 'active'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(attempt)
        .bind(result)
        .execute(&pool)
        .await?;

        Ok(updated.rows_affected() > 0)
    }

    async fn fail(
        &self,
        id: &str,
        worker_id: &str,
        attempt: i32,
        failed: FailedAttempt,
    ) -> Result<Option<JobState>, StoreError> {
        let pool = self.pool().await?;

        let state = match failed.retry_at {
            Some(retry_at) => {
                sqlx::query_scalar::<_, JobState>(
                    r#"
                    UPDATE jobs
                    SET state = 'delayed',
                        run_at = $4,
                        failed_reason = $5,
                        stacktrace = $6,
                        worker_id = NULL,
                        lease_expires_at = NULL
                    WHERE id = $1 AND worker_id = $2 AND attempts = $3 AND state = 'active'
                    RETURNING state
                    "#,
                )
                .bind(id)
                .bind(worker_id)
                .bind(attempt)
                .bind(retry_at)
                .bind(&failed.reason)
                .bind(&failed.stacktrace)
                .fetch_optional(&pool)
                .await?
            }
            None => {
                sqlx::query_scalar::<_, JobState>(
                    r#"
                    UPDATE jobs
                    SET state = 'failed',
                        result = $4,
                        failed_reason = $5,
                        stacktrace = $6,
                        finished_at = NOW(),
                        worker_id = NULL,
                        lease_expires_at = NULL
                    WHERE id = $1 AND worker_id = $2 AND attempts = $3 AND state = 'active'
                    RETURNING state
                    "#,
                )
                .bind(id)
                .bind(worker_id)
                .bind(attempt)
                .bind(&failed.result)
                .bind(&failed.reason)
                .bind(&failed.stacktrace)
                .fetch_optional(&pool)
                .await?
            }
        };

        Ok(state)
    }

    async fn set_paused(&self, queue: QueueName, paused: bool) -> Result<u64, StoreError> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO queue_controls (queue_name, paused, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (queue_name) DO UPDATE
            SET paused = EXCLUDED.paused, updated_at = NOW()
            "#,
        )
        .bind(queue)
        .bind(paused)
        .execute(&mut *tx)
        .await?;

        let (from, to) = if paused {
            (JobState::Waiting, JobState::Paused)
        } else {
            (JobState::Paused, JobState::Waiting)
        };

        let moved = sqlx::query("UPDATE jobs SET state = $3 WHERE queue_name = $1 AND state = $2")
            .bind(queue)
            .bind(from)
            .bind(to)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(queue = %queue, paused, moved = moved.rows_affected(), "queue admission updated");
        Ok(moved.rows_affected())
    }

    async fn is_paused(&self, queue: QueueName) -> Result<bool, StoreError> {
        let pool = self.pool().await?;

        let paused = sqlx::query_scalar::<_, bool>(
            "SELECT paused FROM queue_controls WHERE queue_name = $1",
        )
        .bind(queue)
        .fetch_optional(&pool)
        .await?;

        Ok(paused.unwrap_or(false))
    }

    async fn counts(&self, queue: QueueName) -> Result<StateCounts, StoreError> {
        let pool = self.pool().await?;

        let rows = sqlx::query_as::<_, (JobState, i64)>(
            "SELECT state, COUNT(*) FROM jobs WHERE queue_name = $1 GROUP BY state",
        )
        .bind(queue)
        .fetch_all(&pool)
        .await?;

        let mut counts = StateCounts::default();
        for (state, count) in rows {
            counts.add(state, count);
        }
        Ok(counts)
    }

    async fn list_in_flight(
        &self,
        queue: QueueName,
        limit: i64,
    ) -> Result<Vec<JobSummary>, StoreError> {
        let pool = self.pool().await?;

        let jobs = sqlx::query_as::<_, JobSummary>(
            r#"
            SELECT id, job_type, state, attempts, created_at
            FROM jobs
            WHERE queue_name = $1
              AND state IN ('waiting', 'active', 'delayed', 'paused')
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(queue)
        .bind(limit)
        .fetch_all(&pool)
        .await?;

        Ok(jobs)
    }

    async fn sweep(
        &self,
        queue: QueueName,
        cutoffs: RetentionCutoffs,
    ) -> Result<SweepReport, StoreError> {
        let pool = self.pool().await?;

        let stalled = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'failed',
                failed_reason = 'job stalled: lease expired after final attempt',
                finished_at = NOW(),
                worker_id = NULL,
                lease_expires_at = NULL
            WHERE queue_name = $1
              AND state = 'active'
              AND attempts >= max_attempts
              AND lease_expires_at < NOW()
            "#,
        )
        .bind(queue)
        .execute(&pool)
        .await?;

        let removed = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue_name = $1
              AND (
                  (state = 'completed' AND finished_at < $2)
                  OR (state = 'failed' AND finished_at < $3)
              )
            "#,
        )
        .bind(queue)
        .bind(cutoffs.completed_before)
        .bind(cutoffs.failed_before)
        .execute(&pool)
        .await?;

        Ok(SweepReport {
            removed: removed.rows_affected(),
            stalled_failed: stalled.rows_affected(),
        })
    }

    async fn probe(&self) -> ConnectivityProbe {
        self.connections.probe().await
    }
}
