// SPDX-License-Identifier: GPL-3.0-or-later
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use harmony_application::WatchlistRepository;
use harmony_domain::{ArtistKey, WatchlistEntry};
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::{IntoParams, ToSchema};

use crate::error::ApiError;
use crate::ApiState;

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListWatchlistQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WatchlistEntryResponse {
    pub artist_key: String,
    pub priority: i64,
    pub paused: bool,
    pub pause_reason: Option<String>,
    pub resume_at: Option<DateTime<Utc>>,
    pub last_enqueued_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub retry_budget_remaining: i64,
}

impl From<WatchlistEntry> for WatchlistEntryResponse {
    fn from(entry: WatchlistEntry) -> Self {
        Self {
            artist_key: entry.artist_key.to_string(),
            priority: entry.priority,
            paused: entry.paused,
            pause_reason: entry.pause_reason,
            resume_at: entry.resume_at,
            last_enqueued_at: entry.last_enqueued_at,
            last_synced_at: entry.last_synced_at,
            cooldown_until: entry.cooldown_until,
            retry_budget_remaining: entry.retry_budget_remaining,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpsertWatchlistRequest {
    pub artist_key: String,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PauseRequest {
    pub paused: bool,
    pub reason: Option<String>,
    pub resume_at: Option<DateTime<Utc>>,
}

pub async fn list_watchlist(
    State(state): State<ApiState>,
    Query(query): Query<ListWatchlistQuery>,
) -> Result<Json<Vec<WatchlistEntryResponse>>, ApiError> {
    let entries = state
        .app
        .watchlist
        .list(query.limit.clamp(1, 500), query.offset)
        .await?;
    Ok(Json(
        entries.into_iter().map(WatchlistEntryResponse::from).collect(),
    ))
}

pub async fn upsert_watchlist(
    State(state): State<ApiState>,
    Json(request): Json<UpsertWatchlistRequest>,
) -> Result<Json<WatchlistEntryResponse>, ApiError> {
    let Some(key) = ArtistKey::parse_str(&request.artist_key) else {
        return Err(ApiError::validation(format!(
            "invalid artist key: {} (expected <source>:<source_id>)",
            request.artist_key
        )));
    };

    debug!(target: "api", artist_key = %key, "watchlist upsert");
    let mut entry = WatchlistEntry::new(key, state.app.config.watchlist.retry_budget);
    entry.priority = request.priority;
    let entry = state.app.watchlist.upsert(entry).await?;
    Ok(Json(entry.into()))
}

pub async fn pause_watchlist(
    State(state): State<ApiState>,
    Path(artist_key): Path<String>,
    Json(request): Json<PauseRequest>,
) -> Result<Json<WatchlistEntryResponse>, ApiError> {
    let Some(key) = ArtistKey::parse_str(&artist_key) else {
        return Err(ApiError::validation(format!("invalid artist key: {artist_key}")));
    };
    if state.app.watchlist.get(&key).await?.is_none() {
        return Err(ApiError::not_found(format!("watchlist entry not found: {key}")));
    }

    state
        .app
        .watchlist
        .set_paused(&key, request.paused, request.reason, request.resume_at)
        .await?;

    let entry = state
        .app
        .watchlist
        .get(&key)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("watchlist entry not found: {key}")))?;
    Ok(Json(entry.into()))
}

pub async fn delete_watchlist(
    State(state): State<ApiState>,
    Path(artist_key): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(key) = ArtistKey::parse_str(&artist_key) else {
        return Err(ApiError::validation(format!("invalid artist key: {artist_key}")));
    };
    if state.app.watchlist.get(&key).await?.is_none() {
        return Err(ApiError::not_found(format!("watchlist entry not found: {key}")));
    }
    state.app.watchlist.delete(&key).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
