// SPDX-License-Identifier: GPL-3.0-or-later
use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use harmony_domain::{DeadLetter, Job, JobState, JobType};
use harmony_queue::{EnqueueOptions, JobQueue};
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::{IntoParams, ToSchema};

use crate::error::ApiError;
use crate::ApiState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct EnqueueRequest {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: Option<i64>,
    pub available_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EnqueueResponse {
    pub job_id: i64,
    pub deduplicated: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobResponse {
    pub id: i64,
    pub job_type: String,
    pub state: String,
    pub priority: i64,
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    pub lease_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub idempotency_key: Option<String>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id.as_i64(),
            job_type: job.job_type.as_str().to_string(),
            state: job.state.as_str().to_string(),
            priority: job.priority,
            attempts: job.attempts,
            available_at: job.available_at,
            lease_until: job.lease_until,
            last_error: job.last_error,
            idempotency_key: job.idempotency_key,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeadLetterResponse {
    pub job_id: i64,
    pub job_type: String,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl From<DeadLetter> for DeadLetterResponse {
    fn from(entry: DeadLetter) -> Self {
        Self {
            job_id: entry.job_id.as_i64(),
            job_type: entry.job_type.as_str().to_string(),
            reason: entry.reason,
            attempts: entry.attempts,
            failed_at: entry.failed_at,
            payload: entry.payload,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    pub job_type: Option<String>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PageQuery {
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DlqBatchRequest {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DlqBatchResponse {
    pub affected: u32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct QueueStatsResponse {
    pub pending: i64,
    pub leased: i64,
    pub succeeded: i64,
    pub dead: i64,
}

// ============================================================================
// Handlers
// ============================================================================

/// Enqueue a job
#[utoipa::path(
    post,
    path = "/api/v1/queue/jobs",
    request_body = EnqueueRequest,
    responses(
        (status = 200, description = "Job enqueued or deduplicated", body = EnqueueResponse),
        (status = 400, description = "Unknown job type or bad payload")
    ),
    tag = "queue"
)]
pub async fn enqueue_job(
    State(state): State<ApiState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let Some(job_type) = JobType::parse_str(&request.job_type) else {
        return Err(ApiError::validation(format!(
            "unknown job type: {}",
            request.job_type
        )));
    };

    debug!(target: "api", %job_type, "enqueue requested");
    let outcome = state
        .app
        .queue
        .enqueue(
            job_type,
            request.payload,
            EnqueueOptions {
                priority: request.priority,
                available_at: request.available_at,
                idempotency_key: request.idempotency_key,
            },
        )
        .await?;

    Ok(Json(EnqueueResponse {
        job_id: outcome.job_id.as_i64(),
        deduplicated: outcome.deduplicated,
    }))
}

/// List queue jobs with optional filtering
#[utoipa::path(
    get,
    path = "/api/v1/queue/jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Jobs in weighted order", body = Vec<JobResponse>)
    ),
    tag = "queue"
)]
pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobResponse>>, ApiError> {
    let job_state = match query.state.as_deref() {
        Some(raw) => Some(
            JobState::parse_str(raw)
                .ok_or_else(|| ApiError::validation(format!("unknown state: {raw}")))?,
        ),
        None => None,
    };
    let job_type = match query.job_type.as_deref() {
        Some(raw) => Some(
            JobType::parse_str(raw)
                .ok_or_else(|| ApiError::validation(format!("unknown job type: {raw}")))?,
        ),
        None => None,
    };
    let limit = page_limit(query.limit, &state);

    let jobs = state
        .app
        .queue
        .list_jobs(job_state, job_type, limit, query.offset)
        .await?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

/// Queue counters by state
#[utoipa::path(
    get,
    path = "/api/v1/queue/stats",
    responses((status = 200, description = "Queue counters", body = QueueStatsResponse)),
    tag = "queue"
)]
pub async fn queue_stats(
    State(state): State<ApiState>,
) -> Result<Json<QueueStatsResponse>, ApiError> {
    let stats = state.app.queue.stats().await?;
    Ok(Json(QueueStatsResponse {
        pending: stats.pending,
        leased: stats.leased,
        succeeded: stats.succeeded,
        dead: stats.dead,
    }))
}

/// List dead-letter entries
#[utoipa::path(
    get,
    path = "/api/v1/queue/dead-letter",
    params(PageQuery),
    responses(
        (status = 200, description = "Dead-letter entries, newest first", body = Vec<DeadLetterResponse>)
    ),
    tag = "queue"
)]
pub async fn list_dead_letters(
    State(state): State<ApiState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Vec<DeadLetterResponse>>, ApiError> {
    let limit = page_limit(query.limit, &state);
    let entries = state.app.queue.list_dead_letters(limit, query.offset).await?;
    Ok(Json(
        entries.into_iter().map(DeadLetterResponse::from).collect(),
    ))
}

/// Requeue dead-letter entries
#[utoipa::path(
    post,
    path = "/api/v1/queue/dead-letter/requeue",
    request_body = DlqBatchRequest,
    responses((status = 200, description = "Entries returned to pending", body = DlqBatchResponse)),
    tag = "queue"
)]
pub async fn requeue_dead_letters(
    State(state): State<ApiState>,
    Json(request): Json<DlqBatchRequest>,
) -> Result<Json<DlqBatchResponse>, ApiError> {
    let cap = state.app.config.dlq.requeue_limit;
    let limit = request.limit.unwrap_or(cap).min(cap);
    let affected = state.app.queue.requeue_dead_letters(limit).await?;
    Ok(Json(DlqBatchResponse { affected }))
}

/// Purge dead-letter entries
#[utoipa::path(
    post,
    path = "/api/v1/queue/dead-letter/purge",
    request_body = DlqBatchRequest,
    responses((status = 200, description = "Entries dropped", body = DlqBatchResponse)),
    tag = "queue"
)]
pub async fn purge_dead_letters(
    State(state): State<ApiState>,
    Json(request): Json<DlqBatchRequest>,
) -> Result<Json<DlqBatchResponse>, ApiError> {
    let cap = state.app.config.dlq.purge_limit;
    let limit = request.limit.unwrap_or(cap).min(cap);
    let affected = state.app.queue.purge_dead_letters(limit).await?;
    Ok(Json(DlqBatchResponse { affected }))
}

fn page_limit(requested: Option<i64>, state: &ApiState) -> i64 {
    let default = state.app.config.dlq.page_size_default as i64;
    let max = state.app.config.dlq.page_size_max as i64;
    requested.unwrap_or(default).clamp(1, max)
}
