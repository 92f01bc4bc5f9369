// SPDX-License-Identifier: GPL-3.0-or-later

//! Read surface for artists, served through the response cache.
//!
//! Artist bodies are cached under `/artists/<key>`; the artist_sync
//! handler invalidates that prefix after every reconciliation, so a read
//! issued after a sync never sees the stale body.

use axum::http::{header, HeaderMap, StatusCode};
use axum::{
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::{DateTime, NaiveDate, Utc};
use harmony_application::LibraryRepository;
use harmony_cache::CacheKey;
use harmony_domain::{Artist, ArtistKey, AuditEvent, Release};
use serde::Serialize;
use tracing::debug;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::ApiState;

#[derive(Debug, Serialize, ToSchema)]
pub struct ReleaseResponse {
    pub id: String,
    pub title: String,
    pub release_type: String,
    pub release_date: Option<NaiveDate>,
    pub track_count: Option<u32>,
}

impl From<Release> for ReleaseResponse {
    fn from(release: Release) -> Self {
        Self {
            id: release.id.to_string(),
            title: release.title,
            release_type: release.release_type.as_str().to_string(),
            release_date: release.release_date,
            track_count: release.track_count,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ArtistResponse {
    pub key: String,
    pub name: String,
    pub external_ids: std::collections::BTreeMap<String, String>,
    /// Active releases only; soft-deleted rows are never served.
    pub releases: Vec<ReleaseResponse>,
}

impl ArtistResponse {
    fn new(artist: Artist, releases: Vec<Release>) -> Self {
        Self {
            key: artist.key.to_string(),
            name: artist.name,
            external_ids: artist.external_ids,
            releases: releases.into_iter().map(ReleaseResponse::from).collect(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuditEventResponse {
    pub id: i64,
    pub event: String,
    pub entity_type: String,
    pub at: DateTime<Utc>,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
}

impl From<AuditEvent> for AuditEventResponse {
    fn from(event: AuditEvent) -> Self {
        Self {
            id: event.id,
            event: event.event.as_str().to_string(),
            entity_type: event.entity_type.as_str().to_string(),
            at: event.at,
            before: event.before,
            after: event.after,
        }
    }
}

pub async fn get_artist(
    State(state): State<ApiState>,
    Path(artist_key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(key) = ArtistKey::parse_str(&artist_key) else {
        return Err(ApiError::validation(format!("invalid artist key: {artist_key}")));
    };

    let cache_key = CacheKey::get(&format!("/artists/{key}"));
    if let Some(hit) = state.app.cache.get(&cache_key) {
        debug!(target: "api", artist_key = %key, stale = hit.revalidate, "artist served from cache");
        let mut headers = HeaderMap::new();
        headers.insert(header::ETAG, hit.etag.parse().expect("valid etag"));
        headers.insert(
            header::CACHE_CONTROL,
            hit.cache_control().parse().expect("valid cache-control"),
        );
        if !hit.revalidate {
            return Ok((StatusCode::OK, headers, hit.body));
        }
        // stale hit flagged for revalidation: fall through and refresh
    }

    let Some(artist) = state.app.library.get_artist(&key).await? else {
        return Err(ApiError::not_found(format!("artist not found: {key}")));
    };
    let releases = state.app.library.list_releases(&key, false).await?;

    let body = serde_json::to_vec(&ArtistResponse::new(artist, releases))
        .map_err(|e| ApiError::internal(e.to_string()))?;
    state.app.cache.put(
        cache_key.clone(),
        body.clone(),
        std::time::Duration::from_secs(state.app.config.cache.default_ttl_s),
        std::time::Duration::from_secs(state.app.config.cache.default_swr_s),
    );

    let mut headers = HeaderMap::new();
    if let Some(hit) = state.app.cache.get(&cache_key) {
        headers.insert(header::ETAG, hit.etag.parse().expect("valid etag"));
        headers.insert(
            header::CACHE_CONTROL,
            hit.cache_control().parse().expect("valid cache-control"),
        );
    }
    Ok((StatusCode::OK, headers, body))
}

pub async fn get_artist_audits(
    State(state): State<ApiState>,
    Path(artist_key): Path<String>,
) -> Result<axum::Json<Vec<AuditEventResponse>>, ApiError> {
    let Some(key) = ArtistKey::parse_str(&artist_key) else {
        return Err(ApiError::validation(format!("invalid artist key: {artist_key}")));
    };
    let audits = state.app.library.list_audits(&key, 200, 0).await?;
    Ok(axum::Json(
        audits.into_iter().map(AuditEventResponse::from).collect(),
    ))
}
