// SPDX-License-Identifier: GPL-3.0-or-later
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use harmony_domain::{
    Artist, ArtistKey, AuditEntityType, AuditEvent, AuditEventKind, DownloadFile, DownloadFileId,
    DownloadState, IngestItem, IngestItemId, IngestJob, IngestJobId, IngestMode, IngestState,
    IngestSourceType, JobId, NormalizedTrack, Release, ReleaseId, ReleaseType, WatchlistEntry,
};
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::delta::{ArtistDelta, ReleaseOp};
use crate::repositories::{
    DownloadRepository, IngestRepository, LibraryRepository, WatchlistRepository,
};

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Fallback to SQLite default CURRENT_TIMESTAMP format: "YYYY-MM-DD HH:MM:SS"
    let ndt = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
}

fn parse_dt_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_dt(&v)).transpose()
}

fn parse_key(s: String) -> Result<ArtistKey> {
    ArtistKey::parse_str(&s).ok_or_else(|| anyhow!("invalid artist key: {}", s))
}

fn row_to_watchlist(row: &sqlx::sqlite::SqliteRow) -> Result<WatchlistEntry> {
    let key: String = row.try_get("artist_key")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(WatchlistEntry {
        artist_key: parse_key(key)?,
        priority: row.try_get("priority")?,
        paused: row.try_get("paused")?,
        pause_reason: row.try_get("pause_reason")?,
        resume_at: parse_dt_opt(row.try_get("resume_at")?)?,
        last_enqueued_at: parse_dt_opt(row.try_get("last_enqueued_at")?)?,
        last_synced_at: parse_dt_opt(row.try_get("last_synced_at")?)?,
        cooldown_until: parse_dt_opt(row.try_get("cooldown_until")?)?,
        retry_budget_remaining: row.try_get("retry_budget_remaining")?,
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
    })
}

fn row_to_artist(row: &sqlx::sqlite::SqliteRow) -> Result<Artist> {
    let key: String = row.try_get("artist_key")?;
    let external_ids: String = row.try_get("external_ids")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Artist {
        key: parse_key(key)?,
        name: row.try_get("name")?,
        external_ids: serde_json::from_str(&external_ids)?,
        etag_fingerprint: row.try_get("etag_fingerprint")?,
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
    })
}

fn row_to_release(row: &sqlx::sqlite::SqliteRow) -> Result<Release> {
    let id: String = row.try_get("id")?;
    let key: String = row.try_get("artist_key")?;
    let release_type: String = row.try_get("release_type")?;
    let release_date: Option<String> = row.try_get("release_date")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Release {
        id: ReleaseId::from_uuid(Uuid::parse_str(&id)?),
        artist_key: parse_key(key)?,
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        release_type: ReleaseType::parse_str(&release_type),
        release_date: release_date
            .map(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d"))
            .transpose()?,
        track_count: row.try_get::<Option<i64>, _>("track_count")?.map(|n| n as u32),
        inactive_at: parse_dt_opt(row.try_get("inactive_at")?)?,
        inactive_reason: row.try_get("inactive_reason")?,
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
    })
}

fn row_to_audit(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEvent> {
    let key: String = row.try_get("artist_key")?;
    let event: String = row.try_get("event")?;
    let entity_type: String = row.try_get("entity_type")?;
    let before: Option<String> = row.try_get("before")?;
    let after: Option<String> = row.try_get("after")?;
    let at: String = row.try_get("at")?;

    Ok(AuditEvent {
        id: row.try_get("id")?,
        artist_key: parse_key(key)?,
        job_id: row.try_get::<Option<i64>, _>("job_id")?.map(JobId),
        event: AuditEventKind::parse_str(&event)
            .ok_or_else(|| anyhow!("unknown audit event: {}", event))?,
        entity_type: AuditEntityType::parse_str(&entity_type)
            .ok_or_else(|| anyhow!("unknown audit entity type: {}", entity_type))?,
        before: before.map(|v| serde_json::from_str(&v)).transpose()?,
        after: after.map(|v| serde_json::from_str(&v)).transpose()?,
        at: parse_dt(&at)?,
    })
}

fn row_to_ingest_job(row: &sqlx::sqlite::SqliteRow) -> Result<IngestJob> {
    let id: String = row.try_get("id")?;
    let source_mode: String = row.try_get("source_mode")?;
    let state: String = row.try_get("state")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(IngestJob {
        id: IngestJobId::from_uuid(Uuid::parse_str(&id)?),
        source_mode: IngestMode::parse_str(&source_mode)
            .ok_or_else(|| anyhow!("unknown ingest mode: {}", source_mode))?,
        state: IngestState::parse_str(&state)
            .ok_or_else(|| anyhow!("unknown ingest state: {}", state))?,
        counts: harmony_domain::IngestCounts {
            accepted: row.try_get::<i64, _>("accepted")? as u32,
            skipped: row.try_get::<i64, _>("skipped")? as u32,
            enqueued: row.try_get::<i64, _>("enqueued")? as u32,
            completed: row.try_get::<i64, _>("completed")? as u32,
            failed: row.try_get::<i64, _>("failed")? as u32,
        },
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
    })
}

fn row_to_ingest_item(row: &sqlx::sqlite::SqliteRow) -> Result<IngestItem> {
    let id: String = row.try_get("id")?;
    let job_id: String = row.try_get("ingest_job_id")?;
    let source_type: String = row.try_get("source_type")?;
    let state: String = row.try_get("state")?;
    let normalized: Option<String> = row.try_get("normalized")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(IngestItem {
        id: IngestItemId::from_uuid(Uuid::parse_str(&id)?),
        ingest_job_id: IngestJobId::from_uuid(Uuid::parse_str(&job_id)?),
        source_type: IngestSourceType::parse_str(&source_type)
            .ok_or_else(|| anyhow!("unknown ingest source type: {}", source_type))?,
        raw: row.try_get("raw")?,
        normalized: normalized
            .map(|v| serde_json::from_str::<NormalizedTrack>(&v))
            .transpose()?,
        state: IngestState::parse_str(&state)
            .ok_or_else(|| anyhow!("unknown ingest state: {}", state))?,
        skip_reason: row.try_get("skip_reason")?,
        download_job_id: row.try_get::<Option<i64>, _>("download_job_id")?.map(JobId),
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
    })
}

fn row_to_download_file(row: &sqlx::sqlite::SqliteRow) -> Result<DownloadFile> {
    let id: String = row.try_get("id")?;
    let state: String = row.try_get("state")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(DownloadFile {
        id: DownloadFileId::from_uuid(Uuid::parse_str(&id)?),
        job_id: row.try_get::<Option<i64>, _>("job_id")?.map(JobId),
        peer_username: row.try_get("peer_username")?,
        filename: row.try_get("filename")?,
        size_bytes: row.try_get::<Option<i64>, _>("size_bytes")?.map(|n| n as u64),
        priority: row.try_get("priority")?,
        state: DownloadState::parse_str(&state)
            .ok_or_else(|| anyhow!("unknown download state: {}", state))?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        next_retry_at: parse_dt_opt(row.try_get("next_retry_at")?)?,
        last_error: row.try_get("last_error")?,
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
    })
}

// ----------------------------------------------------------------------------
// Watchlist
// ----------------------------------------------------------------------------

/// SQLx-backed watchlist repository
pub struct SqliteWatchlistRepository {
    pool: SqlitePool,
}

impl SqliteWatchlistRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl WatchlistRepository for SqliteWatchlistRepository {
    async fn upsert(&self, entry: WatchlistEntry) -> Result<WatchlistEntry> {
        debug!(target: "repository", artist_key = %entry.artist_key, "upserting watchlist entry");
        let q = r#"
            INSERT INTO watchlist_artists (
                artist_key, priority, paused, pause_reason, resume_at,
                last_enqueued_at, last_synced_at, cooldown_until,
                retry_budget_remaining, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(artist_key) DO UPDATE SET
                priority = excluded.priority,
                paused = excluded.paused,
                pause_reason = excluded.pause_reason,
                resume_at = excluded.resume_at,
                retry_budget_remaining = excluded.retry_budget_remaining,
                updated_at = excluded.updated_at
        "#;
        sqlx::query(q)
            .bind(entry.artist_key.to_string())
            .bind(entry.priority)
            .bind(entry.paused)
            .bind(entry.pause_reason.clone())
            .bind(entry.resume_at.map(fmt_ts))
            .bind(entry.last_enqueued_at.map(fmt_ts))
            .bind(entry.last_synced_at.map(fmt_ts))
            .bind(entry.cooldown_until.map(fmt_ts))
            .bind(entry.retry_budget_remaining)
            .bind(fmt_ts(entry.created_at))
            .bind(fmt_ts(entry.updated_at))
            .execute(&self.pool)
            .await?;
        Ok(entry)
    }

    async fn get(&self, key: &ArtistKey) -> Result<Option<WatchlistEntry>> {
        let row = sqlx::query("SELECT * FROM watchlist_artists WHERE artist_key = ? LIMIT 1")
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_watchlist(&r)).transpose()
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<WatchlistEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM watchlist_artists ORDER BY priority DESC, artist_key LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_watchlist).collect()
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<WatchlistEntry>> {
        // NULL last_enqueued_at sorts first under ASC, so never-synced
        // artists win ties.
        let rows = sqlx::query(
            r#"
            SELECT * FROM watchlist_artists
            WHERE paused = 0
              AND (resume_at IS NULL OR resume_at <= ?)
              AND (cooldown_until IS NULL OR cooldown_until <= ?)
            ORDER BY priority DESC, last_enqueued_at ASC
            LIMIT ?
            "#,
        )
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_watchlist).collect()
    }

    async fn mark_enqueued(&self, key: &ArtistKey, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE watchlist_artists SET last_enqueued_at = ?, updated_at = ? WHERE artist_key = ?",
        )
        .bind(fmt_ts(at))
        .bind(fmt_ts(at))
        .bind(key.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_synced(&self, key: &ArtistKey, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE watchlist_artists SET last_synced_at = ?, updated_at = ? WHERE artist_key = ?",
        )
        .bind(fmt_ts(at))
        .bind(fmt_ts(at))
        .bind(key.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_cooldown(
        &self,
        key: &ArtistKey,
        until: DateTime<Utc>,
        budget_reset: i64,
    ) -> Result<()> {
        debug!(target: "repository", artist_key = %key, until = %until, "starting cooldown");
        sqlx::query(
            "UPDATE watchlist_artists \
             SET cooldown_until = ?, retry_budget_remaining = ?, updated_at = ? \
             WHERE artist_key = ?",
        )
        .bind(fmt_ts(until))
        .bind(budget_reset)
        .bind(fmt_ts(Utc::now()))
        .bind(key.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn decrement_budget(&self, key: &ArtistKey) -> Result<i64> {
        sqlx::query(
            "UPDATE watchlist_artists \
             SET retry_budget_remaining = MAX(retry_budget_remaining - 1, 0), updated_at = ? \
             WHERE artist_key = ?",
        )
        .bind(fmt_ts(Utc::now()))
        .bind(key.to_string())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT retry_budget_remaining FROM watchlist_artists WHERE artist_key = ?",
        )
        .bind(key.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("retry_budget_remaining")?)
    }

    async fn set_paused(
        &self,
        key: &ArtistKey,
        paused: bool,
        reason: Option<String>,
        resume_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE watchlist_artists \
             SET paused = ?, pause_reason = ?, resume_at = ?, updated_at = ? \
             WHERE artist_key = ?",
        )
        .bind(paused)
        .bind(reason)
        .bind(resume_at.map(fmt_ts))
        .bind(fmt_ts(Utc::now()))
        .bind(key.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &ArtistKey) -> Result<()> {
        let result = sqlx::query("DELETE FROM watchlist_artists WHERE artist_key = ?")
            .bind(key.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("watchlist entry not found: {}", key));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Library (artists, releases, audit)
// ----------------------------------------------------------------------------

/// SQLx-backed library repository
pub struct SqliteLibraryRepository {
    pool: SqlitePool,
}

impl SqliteLibraryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert_audit<'e, E>(
        executor: E,
        key: &ArtistKey,
        job_id: Option<JobId>,
        event: AuditEventKind,
        entity_type: AuditEntityType,
        before: Option<&serde_json::Value>,
        after: Option<&serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            "INSERT INTO artist_audit (artist_key, job_id, event, entity_type, before, after, at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(key.to_string())
        .bind(job_id.map(|j| j.as_i64()))
        .bind(event.as_str())
        .bind(entity_type.as_str())
        .bind(before.map(|v| v.to_string()))
        .bind(after.map(|v| v.to_string()))
        .bind(fmt_ts(at))
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl LibraryRepository for SqliteLibraryRepository {
    async fn get_artist(&self, key: &ArtistKey) -> Result<Option<Artist>> {
        let row = sqlx::query("SELECT * FROM artists WHERE artist_key = ? LIMIT 1")
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_artist(&r)).transpose()
    }

    async fn list_releases(
        &self,
        key: &ArtistKey,
        include_inactive: bool,
    ) -> Result<Vec<Release>> {
        let sql = if include_inactive {
            "SELECT * FROM releases WHERE artist_key = ? ORDER BY title"
        } else {
            "SELECT * FROM releases WHERE artist_key = ? AND inactive_at IS NULL ORDER BY title"
        };
        let rows = sqlx::query(sql)
            .bind(key.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_release).collect()
    }

    async fn create_artist(&self, artist: &Artist, job_id: Option<JobId>) -> Result<()> {
        debug!(target: "repository", artist_key = %artist.key, "creating artist");
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO artists (artist_key, name, external_ids, etag_fingerprint, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(artist.key.to_string())
        .bind(&artist.name)
        .bind(serde_json::to_string(&artist.external_ids)?)
        .bind(&artist.etag_fingerprint)
        .bind(fmt_ts(artist.created_at))
        .bind(fmt_ts(artist.updated_at))
        .execute(&mut *tx)
        .await?;

        let after = serde_json::json!({
            "key": artist.key,
            "name": artist.name,
            "external_ids": artist.external_ids,
        });
        Self::insert_audit(
            &mut *tx,
            &artist.key,
            job_id,
            AuditEventKind::Created,
            AuditEntityType::Artist,
            None,
            Some(&after),
            artist.created_at,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn apply_delta(
        &self,
        key: &ArtistKey,
        delta: &ArtistDelta,
        job_id: Option<JobId>,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let mut tx = self.pool.begin().await?;

        if let Some(artist_op) = &delta.artist_op {
            sqlx::query(
                "UPDATE artists \
                 SET name = ?, external_ids = ?, etag_fingerprint = ?, updated_at = ? \
                 WHERE artist_key = ?",
            )
            .bind(&artist_op.after.name)
            .bind(serde_json::to_string(&artist_op.after.external_ids)?)
            .bind(&artist_op.after.etag_fingerprint)
            .bind(fmt_ts(now))
            .bind(key.to_string())
            .execute(&mut *tx)
            .await?;
        }

        for op in &delta.release_ops {
            match op {
                ReleaseOp::Create(release) => {
                    sqlx::query(
                        "INSERT INTO releases (id, artist_key, source_id, title, release_type, \
                         release_date, track_count, inactive_at, inactive_reason, created_at, updated_at) \
                         VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?)",
                    )
                    .bind(release.id.to_string())
                    .bind(release.artist_key.to_string())
                    .bind(&release.source_id)
                    .bind(&release.title)
                    .bind(release.release_type.as_str())
                    .bind(release.release_date.map(|d| d.format("%Y-%m-%d").to_string()))
                    .bind(release.track_count.map(|n| n as i64))
                    .bind(fmt_ts(now))
                    .bind(fmt_ts(now))
                    .execute(&mut *tx)
                    .await?;
                }
                ReleaseOp::Update { after, .. }
                | ReleaseOp::SoftDelete { after, .. }
                | ReleaseOp::Reactivate { after, .. } => {
                    sqlx::query(
                        "UPDATE releases \
                         SET title = ?, release_type = ?, release_date = ?, track_count = ?, \
                             inactive_at = ?, inactive_reason = ?, updated_at = ? \
                         WHERE id = ?",
                    )
                    .bind(&after.title)
                    .bind(after.release_type.as_str())
                    .bind(after.release_date.map(|d| d.format("%Y-%m-%d").to_string()))
                    .bind(after.track_count.map(|n| n as i64))
                    .bind(after.inactive_at.map(fmt_ts))
                    .bind(&after.inactive_reason)
                    .bind(fmt_ts(now))
                    .bind(after.id.to_string())
                    .execute(&mut *tx)
                    .await?;
                }
                ReleaseOp::HardDelete(release) => {
                    sqlx::query("DELETE FROM releases WHERE id = ?")
                        .bind(release.id.to_string())
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        for audit in &delta.audits {
            Self::insert_audit(
                &mut *tx,
                key,
                job_id,
                audit.event,
                audit.entity_type,
                audit.before.as_ref(),
                audit.after.as_ref(),
                now,
            )
            .await?;
        }

        tx.commit().await?;
        debug!(
            target: "repository",
            artist_key = %key,
            ops = delta.release_ops.len(),
            audits = delta.audits.len(),
            "delta applied"
        );
        Ok(delta.audits.len() as u32)
    }

    async fn list_audits(
        &self,
        key: &ArtistKey,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM artist_audit WHERE artist_key = ? ORDER BY at, id LIMIT ? OFFSET ?",
        )
        .bind(key.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_audit).collect()
    }
}

// ----------------------------------------------------------------------------
// Ingest
// ----------------------------------------------------------------------------

/// SQLx-backed ingest repository
pub struct SqliteIngestRepository {
    pool: SqlitePool,
}

impl SqliteIngestRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl IngestRepository for SqliteIngestRepository {
    async fn create_job(&self, job: &IngestJob) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingest_jobs \
             (id, source_mode, state, accepted, skipped, enqueued, completed, failed, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(job.source_mode.as_str())
        .bind(job.state.as_str())
        .bind(job.counts.accepted as i64)
        .bind(job.counts.skipped as i64)
        .bind(job.counts.enqueued as i64)
        .bind(job.counts.completed as i64)
        .bind(job.counts.failed as i64)
        .bind(fmt_ts(job.created_at))
        .bind(fmt_ts(job.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: IngestJobId) -> Result<Option<IngestJob>> {
        let row = sqlx::query("SELECT * FROM ingest_jobs WHERE id = ? LIMIT 1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_ingest_job(&r)).transpose()
    }

    async fn update_job(&self, job: &IngestJob) -> Result<()> {
        sqlx::query(
            "UPDATE ingest_jobs \
             SET state = ?, accepted = ?, skipped = ?, enqueued = ?, completed = ?, failed = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(job.state.as_str())
        .bind(job.counts.accepted as i64)
        .bind(job.counts.skipped as i64)
        .bind(job.counts.enqueued as i64)
        .bind(job.counts.completed as i64)
        .bind(job.counts.failed as i64)
        .bind(fmt_ts(Utc::now()))
        .bind(job.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_items(&self, items: &[IngestItem]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                "INSERT INTO ingest_items \
                 (id, ingest_job_id, source_type, raw, normalized, state, skip_reason, download_job_id, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(item.id.to_string())
            .bind(item.ingest_job_id.to_string())
            .bind(item.source_type.as_str())
            .bind(&item.raw)
            .bind(
                item.normalized
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            )
            .bind(item.state.as_str())
            .bind(&item.skip_reason)
            .bind(item.download_job_id.map(|j| j.as_i64()))
            .bind(fmt_ts(item.created_at))
            .bind(fmt_ts(item.updated_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_item(&self, id: IngestItemId) -> Result<Option<IngestItem>> {
        let row = sqlx::query("SELECT * FROM ingest_items WHERE id = ? LIMIT 1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_ingest_item(&r)).transpose()
    }

    async fn list_items(
        &self,
        job_id: IngestJobId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<IngestItem>> {
        let rows = sqlx::query(
            "SELECT * FROM ingest_items WHERE ingest_job_id = ? ORDER BY created_at, id LIMIT ? OFFSET ?",
        )
        .bind(job_id.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_ingest_item).collect()
    }

    async fn advance_item(
        &self,
        id: IngestItemId,
        state: IngestState,
        skip_reason: Option<String>,
        download_job_id: Option<JobId>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT state FROM ingest_items WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!("ingest item not found: {}", id))?;
        let current: String = row.try_get("state")?;
        let current = IngestState::parse_str(&current)
            .ok_or_else(|| anyhow!("unknown ingest state: {}", current))?;

        if !current.can_advance_to(state) {
            return Err(anyhow!(
                "ingest item {} cannot move {} -> {}",
                id,
                current,
                state
            ));
        }

        sqlx::query(
            "UPDATE ingest_items \
             SET state = ?, skip_reason = COALESCE(?, skip_reason), \
                 download_job_id = COALESCE(?, download_job_id), updated_at = ? \
             WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(skip_reason)
        .bind(download_job_id.map(|j| j.as_i64()))
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_download_job(&self, id: IngestItemId, job_id: JobId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE ingest_items SET download_job_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(job_id.as_i64())
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("ingest item not found: {}", id));
        }
        Ok(())
    }

    async fn find_item_by_download_job(&self, job_id: JobId) -> Result<Option<IngestItem>> {
        let row = sqlx::query("SELECT * FROM ingest_items WHERE download_job_id = ? LIMIT 1")
            .bind(job_id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_ingest_item(&r)).transpose()
    }

    async fn item_state_counts(
        &self,
        job_id: IngestJobId,
    ) -> Result<std::collections::HashMap<IngestState, i64>> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS n FROM ingest_items WHERE ingest_job_id = ? GROUP BY state",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = std::collections::HashMap::new();
        for row in rows {
            let state: String = row.try_get("state")?;
            let state = IngestState::parse_str(&state)
                .ok_or_else(|| anyhow!("unknown ingest state: {}", state))?;
            counts.insert(state, row.try_get("n")?);
        }
        Ok(counts)
    }
}

// ----------------------------------------------------------------------------
// Downloads
// ----------------------------------------------------------------------------

/// SQLx-backed download file repository
pub struct SqliteDownloadRepository {
    pool: SqlitePool,
}

impl SqliteDownloadRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DownloadRepository for SqliteDownloadRepository {
    async fn insert_files(&self, files: &[DownloadFile]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for file in files {
            sqlx::query(
                "INSERT INTO download_files \
                 (id, job_id, peer_username, filename, size_bytes, priority, state, retry_count, \
                  next_retry_at, last_error, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(file.id.to_string())
            .bind(file.job_id.map(|j| j.as_i64()))
            .bind(&file.peer_username)
            .bind(&file.filename)
            .bind(file.size_bytes.map(|n| n as i64))
            .bind(file.priority)
            .bind(file.state.as_str())
            .bind(file.retry_count as i64)
            .bind(file.next_retry_at.map(fmt_ts))
            .bind(&file.last_error)
            .bind(fmt_ts(file.created_at))
            .bind(fmt_ts(file.updated_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: DownloadFileId) -> Result<Option<DownloadFile>> {
        let row = sqlx::query("SELECT * FROM download_files WHERE id = ? LIMIT 1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_download_file(&r)).transpose()
    }

    async fn update_state(&self, id: DownloadFileId, state: DownloadState) -> Result<()> {
        sqlx::query("UPDATE download_files SET state = ?, updated_at = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(fmt_ts(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: DownloadFileId,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE download_files \
             SET state = 'failed', retry_count = retry_count + 1, next_retry_at = ?, \
                 last_error = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(next_retry_at.map(fmt_ts))
        .bind(error)
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_requeued(&self, id: DownloadFileId, job_id: JobId) -> Result<()> {
        sqlx::query(
            "UPDATE download_files \
             SET state = 'queued', next_retry_at = NULL, job_id = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(job_id.as_i64())
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_retryable(
        &self,
        now: DateTime<Utc>,
        max_retries: u32,
        limit: i64,
    ) -> Result<Vec<DownloadFile>> {
        let rows = sqlx::query(
            "SELECT * FROM download_files \
             WHERE state = 'failed' AND next_retry_at IS NOT NULL AND next_retry_at <= ? \
               AND retry_count < ? \
             ORDER BY next_retry_at ASC LIMIT ?",
        )
        .bind(fmt_ts(now))
        .bind(max_retries as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_download_file).collect()
    }
}
