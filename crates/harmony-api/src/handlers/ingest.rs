// SPDX-License-Identifier: GPL-3.0-or-later
use axum::{extract::State, Json};
use harmony_application::IngestSubmission;
use serde::Serialize;
use tracing::debug;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::ApiState;

#[derive(Debug, Serialize, ToSchema)]
pub struct IngestItemSummary {
    pub item_id: String,
    pub summary: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct IngestSkipSummary {
    pub raw: String,
    pub reason: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct IngestResponse {
    pub ingest_job_id: String,
    pub state: String,
    pub accepted: Vec<IngestItemSummary>,
    pub skipped: Vec<IngestSkipSummary>,
}

/// Submit track lines, an upload, or playlist links for ingestion.
/// A mixed outcome (some accepted, some skipped) is a partial success.
pub async fn submit_ingest(
    State(state): State<ApiState>,
    Json(submission): Json<IngestSubmission>,
) -> Result<Json<IngestResponse>, ApiError> {
    debug!(
        target: "api",
        mode = %submission.mode,
        lines = submission.lines.len(),
        links = submission.links.len(),
        "ingest submission"
    );

    let outcome = state.app.ingest.submit(submission).await?;

    Ok(Json(IngestResponse {
        ingest_job_id: outcome.job.id.to_string(),
        state: outcome.job.state.to_string(),
        accepted: outcome
            .accepted
            .into_iter()
            .map(|item| IngestItemSummary {
                item_id: item.item_id.to_string(),
                summary: item.summary,
            })
            .collect(),
        skipped: outcome
            .skipped
            .into_iter()
            .map(|item| IngestSkipSummary {
                raw: item.raw,
                reason: item.reason,
            })
            .collect(),
    }))
}
