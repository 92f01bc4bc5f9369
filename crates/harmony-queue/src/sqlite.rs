// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use harmony_domain::{DeadLetter, Job, JobId, JobState, JobType};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    EnqueueOptions, EnqueueOutcome, FailOutcome, JobQueue, LeasedJob, QueueError, QueueStats,
    Result,
};

/// SQLx-backed queue store.
///
/// SQLite serializes writers, so the select-then-update in `lease` runs
/// inside one write transaction and no two leasers can claim the same row
/// — the single-process equivalent of `FOR UPDATE SKIP LOCKED`.
pub struct SqliteJobQueue {
    pool: SqlitePool,
    priorities: HashMap<String, i64>,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool, priorities: HashMap<String, i64>) -> Self {
        Self { pool, priorities }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn resolve_priority(&self, job_type: JobType, explicit: Option<i64>) -> i64 {
        explicit
            .or_else(|| self.priorities.get(job_type.as_str()).copied())
            .unwrap_or_else(|| job_type.default_priority())
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// Fixed-width RFC 3339 UTC with microseconds, so TEXT comparisons order
/// the same way the timestamps do.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // SQLite CURRENT_TIMESTAMP fallback: "YYYY-MM-DD HH:MM:SS"
    let ndt = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map_err(|e| QueueError::InvalidRow(format!("bad timestamp {s:?}: {e}")))?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
}

fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_ts(&v)).transpose()
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let id: i64 = row.try_get("id")?;
    let type_str: String = row.try_get("job_type")?;
    let job_type = JobType::parse_str(&type_str)
        .ok_or_else(|| QueueError::InvalidRow(format!("unknown job type: {type_str}")))?;
    let state_str: String = row.try_get("state")?;
    let state = JobState::parse_str(&state_str)
        .ok_or_else(|| QueueError::InvalidRow(format!("unknown job state: {state_str}")))?;
    let payload_str: String = row.try_get("payload")?;
    let available_at: String = row.try_get("available_at")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Job {
        id: JobId(id),
        job_type,
        payload: serde_json::from_str(&payload_str)?,
        priority: row.try_get("priority")?,
        state,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        available_at: parse_ts(&available_at)?,
        lease_until: parse_ts_opt(row.try_get("lease_until")?)?,
        last_heartbeat: parse_ts_opt(row.try_get("last_heartbeat")?)?,
        last_error: row.try_get("last_error")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn row_to_dead_letter(row: &sqlx::sqlite::SqliteRow) -> Result<DeadLetter> {
    let type_str: String = row.try_get("job_type")?;
    let job_type = JobType::parse_str(&type_str)
        .ok_or_else(|| QueueError::InvalidRow(format!("unknown job type: {type_str}")))?;
    let payload_str: String = row.try_get("payload")?;
    let failed_at: String = row.try_get("failed_at")?;

    Ok(DeadLetter {
        job_id: JobId(row.try_get("job_id")?),
        job_type,
        payload: serde_json::from_str(&payload_str)?,
        reason: row.try_get("reason")?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        failed_at: parse_ts(&failed_at)?,
    })
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?")
        .take(n)
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ----------------------------------------------------------------------------
// JobQueue implementation
// ----------------------------------------------------------------------------

#[async_trait::async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<EnqueueOutcome> {
        let now = Utc::now();
        let priority = self.resolve_priority(job_type, opts.priority);
        let available_at = opts.available_at.unwrap_or(now);
        let payload_str = serde_json::to_string(&payload)?;

        let mut tx = self.pool.begin().await?;

        if let Some(key) = opts.idempotency_key.as_deref() {
            let existing = sqlx::query(
                "SELECT id FROM queue_jobs \
                 WHERE job_type = ? AND idempotency_key = ? AND state IN ('pending', 'leased') \
                 LIMIT 1",
            )
            .bind(job_type.as_str())
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                let job_id = JobId(row.try_get("id")?);
                debug!(target: "queue", %job_id, %job_type, key, "enqueue deduplicated");
                tx.commit().await?;
                return Ok(EnqueueOutcome {
                    job_id,
                    deduplicated: true,
                });
            }
        }

        let insert = sqlx::query(
            "INSERT INTO queue_jobs \
             (job_type, payload, priority, state, attempts, available_at, idempotency_key, created_at, updated_at) \
             VALUES (?, ?, ?, 'pending', 0, ?, ?, ?, ?)",
        )
        .bind(job_type.as_str())
        .bind(&payload_str)
        .bind(priority)
        .bind(fmt_ts(available_at))
        .bind(opts.idempotency_key.as_deref())
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&mut *tx)
        .await;

        let result = match insert {
            Ok(done) => {
                let job_id = JobId(done.last_insert_rowid());
                debug!(target: "queue", %job_id, %job_type, priority, "job enqueued");
                tx.commit().await?;
                Ok(EnqueueOutcome {
                    job_id,
                    deduplicated: false,
                })
            }
            // A concurrent enqueue won the unique (type, key) slot between
            // our select and insert; hand back the winner's id.
            Err(error) if is_unique_violation(&error) => {
                drop(tx);
                let key = opts.idempotency_key.as_deref().unwrap_or_default();
                let row = sqlx::query(
                    "SELECT id FROM queue_jobs \
                     WHERE job_type = ? AND idempotency_key = ? AND state IN ('pending', 'leased') \
                     LIMIT 1",
                )
                .bind(job_type.as_str())
                .bind(key)
                .fetch_one(&self.pool)
                .await?;
                Ok(EnqueueOutcome {
                    job_id: JobId(row.try_get("id")?),
                    deduplicated: true,
                })
            }
            Err(error) => Err(error.into()),
        };

        result
    }

    async fn lease(
        &self,
        types: &[JobType],
        now: DateTime<Utc>,
        lease_duration: Duration,
        limit: u32,
    ) -> Result<Vec<LeasedJob>> {
        if types.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let lease_until = now + lease_duration;
        let mut tx = self.pool.begin().await?;

        let select_sql = format!(
            "SELECT id FROM queue_jobs \
             WHERE state = 'pending' AND available_at <= ? AND job_type IN ({}) \
             ORDER BY priority DESC, available_at ASC, id ASC \
             LIMIT ?",
            placeholders(types.len())
        );
        let mut select = sqlx::query(&select_sql).bind(fmt_ts(now));
        for job_type in types {
            select = select.bind(job_type.as_str());
        }
        let rows = select.bind(limit as i64).fetch_all(&mut *tx).await?;

        let mut tokens: Vec<(i64, Uuid)> = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let token = Uuid::new_v4();
            let updated = sqlx::query(
                "UPDATE queue_jobs \
                 SET state = 'leased', lease_until = ?, lease_token = ?, \
                     attempts = attempts + 1, last_heartbeat = ?, updated_at = ? \
                 WHERE id = ? AND state = 'pending'",
            )
            .bind(fmt_ts(lease_until))
            .bind(token.to_string())
            .bind(fmt_ts(now))
            .bind(fmt_ts(now))
            .bind(id)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 1 {
                tokens.push((id, token));
            }
        }

        let mut leased = Vec::with_capacity(tokens.len());
        for (id, token) in &tokens {
            let row = sqlx::query("SELECT * FROM queue_jobs WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            leased.push(LeasedJob {
                job: row_to_job(&row)?,
                lease_token: *token,
            });
        }

        tx.commit().await?;

        if !leased.is_empty() {
            debug!(target: "queue", leased = leased.len(), "jobs leased");
        }
        Ok(leased)
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        lease_until: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE queue_jobs \
             SET lease_until = ?, last_heartbeat = ?, updated_at = ? \
             WHERE id = ? AND state = 'leased' AND lease_token = ?",
        )
        .bind(fmt_ts(lease_until))
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .bind(job_id.as_i64())
        .bind(lease_token.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(job_id));
        }
        Ok(())
    }

    async fn commit(&self, job_id: JobId, lease_token: Uuid) -> Result<()> {
        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE queue_jobs \
             SET state = 'succeeded', lease_until = NULL, lease_token = NULL, updated_at = ? \
             WHERE id = ? AND state = 'leased' AND lease_token = ? AND lease_until >= ?",
        )
        .bind(fmt_ts(now))
        .bind(job_id.as_i64())
        .bind(lease_token.to_string())
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(job_id));
        }
        debug!(target: "queue", %job_id, "job committed");
        Ok(())
    }

    async fn fail(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        error: &str,
        retryable: bool,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<FailOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT attempts, job_type, payload FROM queue_jobs \
             WHERE id = ? AND state = 'leased' AND lease_token = ?",
        )
        .bind(job_id.as_i64())
        .bind(lease_token.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(QueueError::LeaseLost(job_id));
        };
        let attempts: i64 = row.try_get("attempts")?;
        let job_type: String = row.try_get("job_type")?;
        let payload: String = row.try_get("payload")?;

        let outcome = if retryable && (attempts as u32) < max_attempts {
            sqlx::query(
                "UPDATE queue_jobs \
                 SET state = 'pending', available_at = ?, last_error = ?, \
                     lease_until = NULL, lease_token = NULL, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(fmt_ts(retry_at))
            .bind(error)
            .bind(fmt_ts(now))
            .bind(job_id.as_i64())
            .execute(&mut *tx)
            .await?;
            debug!(
                target: "queue",
                %job_id, attempts, retry_at = %retry_at, "job scheduled for retry"
            );
            FailOutcome::Retried {
                available_at: retry_at,
            }
        } else {
            sqlx::query(
                "UPDATE queue_jobs \
                 SET state = 'dead', last_error = ?, \
                     lease_until = NULL, lease_token = NULL, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(error)
            .bind(fmt_ts(now))
            .bind(job_id.as_i64())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT OR REPLACE INTO dead_letter \
                 (job_id, job_type, payload, reason, attempts, failed_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(job_id.as_i64())
            .bind(&job_type)
            .bind(&payload)
            .bind(error)
            .bind(attempts)
            .bind(fmt_ts(now))
            .execute(&mut *tx)
            .await?;

            warn!(target: "queue", %job_id, job_type, attempts, "job dead-lettered");
            FailOutcome::Dead
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn reap(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT id, job_type FROM queue_jobs WHERE state = 'leased' AND lease_until < ?",
        )
        .bind(fmt_ts(now))
        .fetch_all(&mut *tx)
        .await?;

        let mut reaped = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let job_type: String = row.try_get("job_type")?;
            sqlx::query(
                "UPDATE queue_jobs \
                 SET state = 'pending', lease_until = NULL, lease_token = NULL, updated_at = ? \
                 WHERE id = ? AND state = 'leased'",
            )
            .bind(fmt_ts(now))
            .bind(id)
            .execute(&mut *tx)
            .await?;
            warn!(
                target: "queue",
                event = "orchestrator.lease.lost",
                job_id = id,
                job_type,
                "expired lease restored to pending"
            );
            reaped.push(JobId(id));
        }

        tx.commit().await?;
        Ok(reaped)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM queue_jobs WHERE id = ? LIMIT 1")
            .bind(job_id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    async fn list_jobs(
        &self,
        state: Option<JobState>,
        job_type: Option<JobType>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>> {
        let mut sql = String::from("SELECT * FROM queue_jobs WHERE 1 = 1");
        if state.is_some() {
            sql.push_str(" AND state = ?");
        }
        if job_type.is_some() {
            sql.push_str(" AND job_type = ?");
        }
        sql.push_str(" ORDER BY priority DESC, available_at ASC, id ASC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(state) = state {
            query = query.bind(state.as_str());
        }
        if let Some(job_type) = job_type {
            query = query.bind(job_type.as_str());
        }
        let rows = query.bind(limit).bind(offset).fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row_to_job(&row)?);
        }
        Ok(out)
    }

    async fn pending_count(&self, job_type: Option<JobType>) -> Result<i64> {
        let row = match job_type {
            Some(job_type) => {
                sqlx::query(
                    "SELECT COUNT(*) AS n FROM queue_jobs \
                     WHERE state IN ('pending', 'leased') AND job_type = ?",
                )
                .bind(job_type.as_str())
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT COUNT(*) AS n FROM queue_jobs WHERE state IN ('pending', 'leased')")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(row.try_get("n")?)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT \
                 SUM(CASE WHEN state = 'pending' THEN 1 ELSE 0 END) AS pending, \
                 SUM(CASE WHEN state = 'leased' THEN 1 ELSE 0 END) AS leased, \
                 SUM(CASE WHEN state = 'succeeded' THEN 1 ELSE 0 END) AS succeeded, \
                 SUM(CASE WHEN state = 'dead' THEN 1 ELSE 0 END) AS dead \
             FROM queue_jobs",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: row.try_get::<Option<i64>, _>("pending")?.unwrap_or(0),
            leased: row.try_get::<Option<i64>, _>("leased")?.unwrap_or(0),
            succeeded: row.try_get::<Option<i64>, _>("succeeded")?.unwrap_or(0),
            dead: row.try_get::<Option<i64>, _>("dead")?.unwrap_or(0),
        })
    }

    async fn list_dead_letters(&self, limit: i64, offset: i64) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT * FROM dead_letter ORDER BY failed_at DESC, job_id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row_to_dead_letter(&row)?);
        }
        Ok(out)
    }

    async fn requeue_dead_letters(&self, limit: u32) -> Result<u32> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query("SELECT job_id FROM dead_letter ORDER BY failed_at ASC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await?;

        let mut requeued = 0u32;
        for row in &rows {
            let job_id: i64 = row.try_get("job_id")?;
            let updated = sqlx::query(
                "UPDATE queue_jobs \
                 SET state = 'pending', attempts = 0, available_at = ?, \
                     last_error = NULL, lease_until = NULL, lease_token = NULL, updated_at = ? \
                 WHERE id = ? AND state = 'dead'",
            )
            .bind(fmt_ts(now))
            .bind(fmt_ts(now))
            .bind(job_id)
            .execute(&mut *tx)
            .await;

            match updated {
                Ok(done) if done.rows_affected() == 1 => {
                    sqlx::query("DELETE FROM dead_letter WHERE job_id = ?")
                        .bind(job_id)
                        .execute(&mut *tx)
                        .await?;
                    requeued += 1;
                }
                Ok(_) => {
                    // Job row vanished under retention; drop the orphan entry.
                    sqlx::query("DELETE FROM dead_letter WHERE job_id = ?")
                        .bind(job_id)
                        .execute(&mut *tx)
                        .await?;
                }
                Err(error) if is_unique_violation(&error) => {
                    warn!(
                        target: "queue",
                        job_id,
                        "skipping requeue, idempotency slot occupied by a live job"
                    );
                }
                Err(error) => return Err(error.into()),
            }
        }

        tx.commit().await?;
        debug!(target: "queue", requeued, "dead letters requeued");
        Ok(requeued)
    }

    async fn purge_dead_letters(&self, limit: u32) -> Result<u32> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query("SELECT job_id FROM dead_letter ORDER BY failed_at ASC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await?;

        let mut purged = 0u32;
        for row in &rows {
            let job_id: i64 = row.try_get("job_id")?;
            sqlx::query("DELETE FROM dead_letter WHERE job_id = ?")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM queue_jobs WHERE id = ? AND state = 'dead'")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            purged += 1;
        }

        tx.commit().await?;
        debug!(target: "queue", purged, "dead letters purged");
        Ok(purged)
    }

    async fn cleanup_succeeded(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM queue_jobs WHERE state = 'succeeded' AND updated_at < ?")
                .bind(fmt_ts(older_than))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_format_is_lexicographically_ordered() {
        let earlier = Utc::now();
        let later = earlier + Duration::milliseconds(1);
        assert!(fmt_ts(earlier) < fmt_ts(later));
        // storage precision is microseconds
        let parsed = parse_ts(&fmt_ts(earlier)).unwrap();
        assert_eq!(parsed.timestamp_micros(), earlier.timestamp_micros());
    }

    #[test]
    fn current_timestamp_fallback_parses() {
        let parsed = parse_ts("2026-08-01 10:30:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-08-01T10:30:00+00:00");
    }

    #[test]
    fn placeholder_list() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }
}
