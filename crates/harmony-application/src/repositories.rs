// SPDX-License-Identifier: GPL-3.0-or-later
use anyhow::Result;
use chrono::{DateTime, Utc};
use harmony_domain::{
    Artist, ArtistKey, AuditEvent, DownloadFile, DownloadFileId, DownloadState, IngestItem,
    IngestItemId, IngestJob, IngestJobId, IngestState, JobId, Release, WatchlistEntry,
};

use crate::delta::ArtistDelta;

// ============================================================================
// Repository Traits
// ============================================================================

/// Watchlist entries: operator-owned rows driving the timer.
#[async_trait::async_trait]
pub trait WatchlistRepository: Send + Sync {
    async fn upsert(&self, entry: WatchlistEntry) -> Result<WatchlistEntry>;
    async fn get(&self, key: &ArtistKey) -> Result<Option<WatchlistEntry>>;
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<WatchlistEntry>>;
    /// Entries eligible for a timer tick: not paused, resume/cooldown past,
    /// ordered by `priority DESC, last_enqueued_at ASC` (never-enqueued
    /// first).
    async fn list_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<WatchlistEntry>>;
    async fn mark_enqueued(&self, key: &ArtistKey, at: DateTime<Utc>) -> Result<()>;
    async fn mark_synced(&self, key: &ArtistKey, at: DateTime<Utc>) -> Result<()>;
    /// Start a cooldown window and reset the retry budget.
    async fn set_cooldown(
        &self,
        key: &ArtistKey,
        until: DateTime<Utc>,
        budget_reset: i64,
    ) -> Result<()>;
    /// Spend one unit of retry budget; returns the remainder.
    async fn decrement_budget(&self, key: &ArtistKey) -> Result<i64>;
    async fn set_paused(
        &self,
        key: &ArtistKey,
        paused: bool,
        reason: Option<String>,
        resume_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    async fn delete(&self, key: &ArtistKey) -> Result<()>;
}

/// Artists, releases, and the append-only audit trail.
#[async_trait::async_trait]
pub trait LibraryRepository: Send + Sync {
    async fn get_artist(&self, key: &ArtistKey) -> Result<Option<Artist>>;
    async fn list_releases(&self, key: &ArtistKey, include_inactive: bool)
        -> Result<Vec<Release>>;
    /// First sight of an artist: insert it with a `created` audit row.
    async fn create_artist(&self, artist: &Artist, job_id: Option<JobId>) -> Result<()>;
    /// Apply a reconciliation delta and its audit rows in one transaction.
    /// Returns the number of audit rows written.
    async fn apply_delta(
        &self,
        key: &ArtistKey,
        delta: &ArtistDelta,
        job_id: Option<JobId>,
        now: DateTime<Utc>,
    ) -> Result<u32>;
    async fn list_audits(&self, key: &ArtistKey, limit: i64, offset: i64)
        -> Result<Vec<AuditEvent>>;
}

/// Ingest jobs and their items.
#[async_trait::async_trait]
pub trait IngestRepository: Send + Sync {
    async fn create_job(&self, job: &IngestJob) -> Result<()>;
    async fn get_job(&self, id: IngestJobId) -> Result<Option<IngestJob>>;
    async fn update_job(&self, job: &IngestJob) -> Result<()>;
    async fn insert_items(&self, items: &[IngestItem]) -> Result<()>;
    async fn get_item(&self, id: IngestItemId) -> Result<Option<IngestItem>>;
    async fn list_items(
        &self,
        job_id: IngestJobId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<IngestItem>>;
    /// Advance an item along the state ladder. Regressions are rejected.
    async fn advance_item(
        &self,
        id: IngestItemId,
        state: IngestState,
        skip_reason: Option<String>,
        download_job_id: Option<JobId>,
    ) -> Result<()>;
    /// Attach the download job handling an item without touching its state.
    async fn set_download_job(&self, id: IngestItemId, job_id: JobId) -> Result<()>;
    /// Reverse lookup: the item a download job was enqueued for.
    async fn find_item_by_download_job(&self, job_id: JobId) -> Result<Option<IngestItem>>;
    /// Per-state item counts for one ingest job.
    async fn item_state_counts(
        &self,
        job_id: IngestJobId,
    ) -> Result<std::collections::HashMap<IngestState, i64>>;
}

/// Per-file download records scanned by the retry reaper.
#[async_trait::async_trait]
pub trait DownloadRepository: Send + Sync {
    async fn insert_files(&self, files: &[DownloadFile]) -> Result<()>;
    async fn get(&self, id: DownloadFileId) -> Result<Option<DownloadFile>>;
    async fn update_state(&self, id: DownloadFileId, state: DownloadState) -> Result<()>;
    /// Failure with retry metadata: bumps `retry_count`, records the error
    /// and the next retry time.
    async fn mark_failed(
        &self,
        id: DownloadFileId,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    /// Hand a failed file back to a fresh sync job.
    async fn mark_requeued(&self, id: DownloadFileId, job_id: JobId) -> Result<()>;
    /// Failed files whose `next_retry_at` has passed and whose retry count
    /// is below the cap.
    async fn list_retryable(
        &self,
        now: DateTime<Utc>,
        max_retries: u32,
        limit: i64,
    ) -> Result<Vec<DownloadFile>>;
}
