// SPDX-License-Identifier: GPL-3.0-or-later

//! The provider gateway: one contract over both external providers.
//!
//! Every call is bounded by the provider's timeout (on the HTTP client), a
//! retry budget with the shared backoff+jitter formula, and a global
//! concurrency semaphore. Each attempt emits an `api.dependency` event.

use std::sync::Arc;
use std::time::Instant;

use harmony_config::{ProviderEndpointConfig, ProvidersConfig};
use harmony_domain::RetryPolicy;
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::error::{ProviderError, Result};
use crate::metadata::{HttpMetadataProvider, MetadataProvider};
use crate::models::{
    ArtistWithReleases, DownloadRequestFile, DownloadTicket, DownloadTicketState, PeerResult,
    ProviderHealth, ProviderPlaylist, ProviderTrack,
};
use crate::peer::{HttpPeerDaemon, PeerDaemon};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Metadata,
    Peer,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Peer => "peer",
        }
    }
}

/// Per-provider attempt policy derived from configuration.
#[derive(Debug, Clone, Copy)]
struct CallPolicy {
    retry_max: u32,
    backoff: RetryPolicy,
}

impl CallPolicy {
    fn from_config(config: &ProviderEndpointConfig) -> Self {
        Self {
            retry_max: config.retry_max.max(1),
            backoff: RetryPolicy {
                max_attempts: config.retry_max.max(1),
                base_seconds: config.backoff_base_ms as f64 / 1_000.0,
                jitter_pct: config.jitter_pct,
                timeout_seconds: None,
            },
        }
    }
}

pub struct ProviderGateway {
    metadata: Arc<dyn MetadataProvider>,
    peer: Arc<dyn PeerDaemon>,
    semaphore: Arc<Semaphore>,
    metadata_policy: CallPolicy,
    peer_policy: CallPolicy,
}

impl ProviderGateway {
    /// Build HTTP adapters from configuration.
    pub fn from_config(config: &ProvidersConfig) -> Result<Self> {
        let metadata = HttpMetadataProvider::builder()
            .base_url(config.metadata.base_url.clone())
            .timeout(std::time::Duration::from_millis(config.metadata.timeout_ms))
            .api_key(config.metadata.api_key.clone())
            .build()?;
        let peer = HttpPeerDaemon::builder()
            .base_url(config.peer.base_url.clone())
            .timeout(std::time::Duration::from_millis(config.peer.timeout_ms))
            .api_key(config.peer.api_key.clone())
            .build()?;
        Ok(Self::new(
            Arc::new(metadata),
            Arc::new(peer),
            config,
        ))
    }

    /// Wire explicit adapters; tests use this with in-memory fakes.
    pub fn new(
        metadata: Arc<dyn MetadataProvider>,
        peer: Arc<dyn PeerDaemon>,
        config: &ProvidersConfig,
    ) -> Self {
        Self {
            metadata,
            peer,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            metadata_policy: CallPolicy::from_config(&config.metadata),
            peer_policy: CallPolicy::from_config(&config.peer),
        }
    }

    async fn call<T, F, Fut>(
        &self,
        provider: Provider,
        operation: &'static str,
        policy: CallPolicy,
        run: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 1u32;
        loop {
            let started = Instant::now();
            let outcome = {
                let _permit = self
                    .semaphore
                    .acquire()
                    .await
                    .expect("gateway semaphore closed");
                run().await
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(value) => {
                    info!(
                        target: "providers",
                        event = "api.dependency",
                        provider = provider.as_str(),
                        operation,
                        attempt,
                        status = "ok",
                        duration_ms,
                    );
                    return Ok(value);
                }
                Err(error) => {
                    let retryable = error.is_retryable() && attempt < policy.retry_max;
                    let retry_in_ms = if retryable {
                        Some(next_delay_ms(&policy, attempt, &error))
                    } else {
                        None
                    };
                    warn!(
                        target: "providers",
                        event = "api.dependency",
                        provider = provider.as_str(),
                        operation,
                        attempt,
                        status = error.class(),
                        duration_ms,
                        retry_in_ms,
                        error = %error,
                    );

                    let Some(delay_ms) = retry_in_ms else {
                        return Err(error);
                    };
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }

    // ---- metadata ----------------------------------------------------------

    pub async fn search_tracks(&self, query: &str, limit: u32) -> Result<Vec<ProviderTrack>> {
        let provider = self.metadata.clone();
        let query = query.to_string();
        self.call(Provider::Metadata, "search_tracks", self.metadata_policy, move || {
            let provider = provider.clone();
            let query = query.clone();
            async move { provider.search_tracks(&query, limit).await }
        })
        .await
    }

    pub async fn get_artist_albums(&self, artist_id: &str) -> Result<ArtistWithReleases> {
        let provider = self.metadata.clone();
        let artist_id = artist_id.to_string();
        self.call(Provider::Metadata, "get_artist_albums", self.metadata_policy, move || {
            let provider = provider.clone();
            let artist_id = artist_id.clone();
            async move { provider.get_artist_albums(&artist_id).await }
        })
        .await
    }

    pub async fn get_playlist(&self, playlist_id: &str) -> Result<ProviderPlaylist> {
        let provider = self.metadata.clone();
        let playlist_id = playlist_id.to_string();
        self.call(Provider::Metadata, "get_playlist", self.metadata_policy, move || {
            let provider = provider.clone();
            let playlist_id = playlist_id.clone();
            async move { provider.get_playlist(&playlist_id).await }
        })
        .await
    }

    pub async fn get_track_by_isrc(&self, isrc: &str) -> Result<Option<ProviderTrack>> {
        let provider = self.metadata.clone();
        let isrc = isrc.to_string();
        self.call(Provider::Metadata, "get_track_by_isrc", self.metadata_policy, move || {
            let provider = provider.clone();
            let isrc = isrc.clone();
            async move { provider.get_track_by_isrc(&isrc).await }
        })
        .await
    }

    // ---- peer --------------------------------------------------------------

    pub async fn search_peer(&self, query: &str) -> Result<Vec<PeerResult>> {
        let provider = self.peer.clone();
        let query = query.to_string();
        self.call(Provider::Peer, "search_peer", self.peer_policy, move || {
            let provider = provider.clone();
            let query = query.clone();
            async move { provider.search_peer(&query).await }
        })
        .await
    }

    pub async fn enqueue_peer_download(
        &self,
        username: &str,
        files: &[DownloadRequestFile],
    ) -> Result<DownloadTicket> {
        let provider = self.peer.clone();
        let username = username.to_string();
        let files = files.to_vec();
        self.call(Provider::Peer, "enqueue_peer_download", self.peer_policy, move || {
            let provider = provider.clone();
            let username = username.clone();
            let files = files.clone();
            async move { provider.enqueue_download(&username, &files).await }
        })
        .await
    }

    pub async fn poll_peer_download(&self, ticket: &DownloadTicket) -> Result<DownloadTicketState> {
        let provider = self.peer.clone();
        let ticket = ticket.clone();
        self.call(Provider::Peer, "poll_peer_download", self.peer_policy, move || {
            let provider = provider.clone();
            let ticket = ticket.clone();
            async move { provider.poll_download(&ticket).await }
        })
        .await
    }

    pub async fn cancel_peer_download(&self, ticket: &DownloadTicket) -> Result<()> {
        let provider = self.peer.clone();
        let ticket = ticket.clone();
        self.call(Provider::Peer, "cancel_peer_download", self.peer_policy, move || {
            let provider = provider.clone();
            let ticket = ticket.clone();
            async move { provider.cancel_download(&ticket).await }
        })
        .await
    }

    // ---- health ------------------------------------------------------------

    /// Single probe, no retries: the health monitor interprets failures.
    pub async fn check_health(&self, provider: Provider) -> Result<ProviderHealth> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("gateway semaphore closed");
        match provider {
            Provider::Metadata => self.metadata.check_health().await,
            Provider::Peer => self.peer.check_health().await,
        }
    }
}

/// Rate-limited responses carry their own delay; otherwise sample the
/// shared backoff formula.
fn next_delay_ms(policy: &CallPolicy, attempt: u32, error: &ProviderError) -> u64 {
    if let ProviderError::RateLimited {
        retry_after_ms: Some(ms),
    } = error
    {
        return *ms;
    }
    let jitter_unit: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
    (policy.backoff.backoff_seconds(attempt, jitter_unit) * 1_000.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, jitter: f64) -> CallPolicy {
        CallPolicy {
            retry_max: 3,
            backoff: RetryPolicy {
                max_attempts: 3,
                base_seconds: base_ms as f64 / 1_000.0,
                jitter_pct: jitter,
                timeout_seconds: None,
            },
        }
    }

    #[test]
    fn rate_limit_hint_wins_over_backoff() {
        let delay = next_delay_ms(
            &policy(100, 0.0),
            1,
            &ProviderError::RateLimited {
                retry_after_ms: Some(7_500),
            },
        );
        assert_eq!(delay, 7_500);
    }

    #[test]
    fn backoff_delay_doubles_without_jitter() {
        let p = policy(100, 0.0);
        let transient = ProviderError::Transient("x".into());
        assert_eq!(next_delay_ms(&p, 1, &transient), 100);
        assert_eq!(next_delay_ms(&p, 2, &transient), 200);
        assert_eq!(next_delay_ms(&p, 3, &transient), 400);
    }
}
