// SPDX-License-Identifier: GPL-3.0-or-later

//! Metadata provider adapter.
//!
//! Speaks the catalogue service's JSON API. The adapter performs single
//! attempts only; timeouts live on the HTTP client and retry/concurrency
//! policy is owned by the gateway.

use crate::error::{classify_status, ProviderError, Result};
use crate::models::{
    ArtistWithReleases, ProviderHealth, ProviderPlaylist, ProviderTrack,
};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::trace;
use url::Url;

const USER_AGENT: &str = concat!("Harmony/", env!("CARGO_PKG_VERSION"));

#[async_trait::async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn search_tracks(&self, query: &str, limit: u32) -> Result<Vec<ProviderTrack>>;
    async fn get_artist_albums(&self, artist_id: &str) -> Result<ArtistWithReleases>;
    async fn get_playlist(&self, playlist_id: &str) -> Result<ProviderPlaylist>;
    async fn get_track_by_isrc(&self, isrc: &str) -> Result<Option<ProviderTrack>>;
    async fn check_health(&self) -> Result<ProviderHealth>;
}

#[derive(Debug, Clone)]
pub struct HttpMetadataProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpMetadataProvider {
    pub fn builder() -> HttpMetadataProviderBuilder {
        HttpMetadataProviderBuilder::default()
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| ProviderError::InvalidResponse(format!("invalid base url: {e}")))?;
        base.join(path)
            .map_err(|e| ProviderError::InvalidResponse(format!("invalid path {path}: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        trace!(target: "providers", provider = "metadata", %url, "GET");

        let mut request = self.client.get(url);
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = retry_after_ms(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, retry_after_ms));
        }

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse response: {e}")))
    }
}

pub(crate) fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|secs| secs * 1_000)
}

#[async_trait::async_trait]
impl MetadataProvider for HttpMetadataProvider {
    async fn search_tracks(&self, query: &str, limit: u32) -> Result<Vec<ProviderTrack>> {
        let mut url = self.endpoint("/v1/search/tracks")?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("limit", &limit.to_string());
        let response: TrackSearchResponse = self.get_json(url).await?;
        Ok(response.tracks)
    }

    async fn get_artist_albums(&self, artist_id: &str) -> Result<ArtistWithReleases> {
        let url = self.endpoint(&format!("/v1/artists/{artist_id}/albums"))?;
        self.get_json(url).await
    }

    async fn get_playlist(&self, playlist_id: &str) -> Result<ProviderPlaylist> {
        let url = self.endpoint(&format!("/v1/playlists/{playlist_id}"))?;
        self.get_json(url).await
    }

    async fn get_track_by_isrc(&self, isrc: &str) -> Result<Option<ProviderTrack>> {
        let url = self.endpoint(&format!("/v1/tracks/isrc/{isrc}"))?;
        match self.get_json(url).await {
            Ok(track) => Ok(Some(track)),
            Err(ProviderError::Permanent(message)) if message.contains("404") => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn check_health(&self) -> Result<ProviderHealth> {
        let url = self.endpoint("/health")?;
        self.get_json(url).await
    }
}

#[derive(Debug, serde::Deserialize)]
struct TrackSearchResponse {
    tracks: Vec<ProviderTrack>,
}

#[derive(Debug)]
pub struct HttpMetadataProviderBuilder {
    base_url: String,
    timeout: Duration,
    api_key: Option<String>,
}

impl Default for HttpMetadataProviderBuilder {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8700".to_string(),
            timeout: Duration::from_secs(10),
            api_key: None,
        }
    }
}

impl HttpMetadataProviderBuilder {
    /// Set a custom base URL (useful for testing with mock servers).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    pub fn build(self) -> Result<HttpMetadataProvider> {
        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::Permanent(format!("http client: {e}")))?;

        Ok(HttpMetadataProvider {
            client,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            api_key: self.api_key,
        })
    }
}
