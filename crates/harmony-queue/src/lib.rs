// SPDX-License-Identifier: GPL-3.0-or-later

//! Persistent priority job queue with visibility leases.
//!
//! Jobs move `pending → leased → (pending | succeeded | dead)`; a lease is
//! held by exactly one worker and identified by a per-lease token. Workers
//! extend leases with heartbeats; abandoned leases are restored to
//! `pending` by the reaper without touching the attempt counter. Jobs that
//! exhaust their retry budget land in the dead-letter tier together with a
//! `dead_letter` row carrying the original payload.

pub mod sqlite;

use chrono::{DateTime, Duration, Utc};
use harmony_domain::{DeadLetter, ErrorCode, Job, JobId, JobState, JobType};
use thiserror::Error;
use uuid::Uuid;

pub use sqlite::SqliteJobQueue;

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid job row: {0}")]
    InvalidRow(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::LeaseLost(_) => ErrorCode::LeaseLost,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidRow(_) | Self::Database(_) | Self::Serialization(_) => {
                ErrorCode::InternalError
            }
        }
    }
}

/// Optional knobs for `enqueue`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Explicit priority; otherwise the configured type weight applies.
    pub priority: Option<i64>,
    /// Earliest execution time; defaults to now.
    pub available_at: Option<DateTime<Utc>>,
    /// Collapses duplicate enqueues of the same logical intent while the
    /// earlier job is not yet terminal.
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub job_id: JobId,
    pub deduplicated: bool,
}

/// A job handed to a worker, together with the token proving lease
/// ownership for heartbeat/commit/fail calls.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: Job,
    pub lease_token: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled; the job is pending again at `available_at`.
    Retried { available_at: DateTime<Utc> },
    /// Retry budget exhausted or failure permanent; dead-lettered.
    Dead,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub leased: i64,
    pub succeeded: i64,
    pub dead: i64,
}

/// Port over the durable queue, consumed by the orchestrator, the ingest
/// service, and the administrative surface.
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a job, or return the live job already registered under the
    /// same `(type, idempotency_key)`.
    async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<EnqueueOutcome>;

    /// Atomically claim up to `limit` due jobs in weighted order
    /// (`priority DESC, available_at ASC, id ASC`). Each claim increments
    /// `attempts` and stamps a fresh lease token.
    async fn lease(
        &self,
        types: &[JobType],
        now: DateTime<Utc>,
        lease_duration: Duration,
        limit: u32,
    ) -> Result<Vec<LeasedJob>>;

    /// Extend a held lease. Fails with `LeaseLost` when the caller no
    /// longer owns the job.
    async fn heartbeat(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        lease_until: DateTime<Utc>,
    ) -> Result<()>;

    /// Transition `leased → succeeded`. Fails with `LeaseLost` when the
    /// lease expired or was taken over.
    async fn commit(&self, job_id: JobId, lease_token: Uuid) -> Result<()>;

    /// Record a failure. Retryable failures below `max_attempts` go back
    /// to `pending` at `retry_at`; everything else is dead-lettered in the
    /// same transaction.
    async fn fail(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        error: &str,
        retryable: bool,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<FailOutcome>;

    /// Restore expired leases to `pending` without incrementing
    /// `attempts`. Returns the affected job ids.
    async fn reap(&self, now: DateTime<Utc>) -> Result<Vec<JobId>>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>>;

    async fn list_jobs(
        &self,
        state: Option<JobState>,
        job_type: Option<JobType>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>>;

    /// Number of non-terminal jobs, optionally narrowed to one type. Used
    /// by the ingest service for backpressure.
    async fn pending_count(&self, job_type: Option<JobType>) -> Result<i64>;

    async fn stats(&self) -> Result<QueueStats>;

    async fn list_dead_letters(&self, limit: i64, offset: i64) -> Result<Vec<DeadLetter>>;

    /// Return up to `limit` dead-lettered jobs to `pending` with a reset
    /// attempt counter. Entries whose idempotency slot is occupied by a
    /// live job are skipped.
    async fn requeue_dead_letters(&self, limit: u32) -> Result<u32>;

    /// Drop up to `limit` dead-letter entries and their terminal job rows.
    async fn purge_dead_letters(&self, limit: u32) -> Result<u32>;

    /// Bounded retention: delete succeeded jobs older than the cutoff.
    async fn cleanup_succeeded(&self, older_than: DateTime<Utc>) -> Result<u64>;
}
