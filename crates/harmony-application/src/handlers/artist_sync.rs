// SPDX-License-Identifier: GPL-3.0-or-later

//! Artist synchronization: fetch the provider's view of an artist, diff it
//! against the library, and apply the delta with its audit trail.

use std::sync::Arc;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use harmony_cache::ResponseCache;
use harmony_config::ReconcileConfig;
use harmony_domain::{Artist, ArtistKey, JobType, Release, ReleaseType};
use harmony_providers::{ProviderError, ProviderGateway, ProviderRelease};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::delta::{diff, DeltaPolicy};
use crate::handlers::{HandlerOutcome, JobContext, JobHandler};
use crate::locks::ArtistLockRegistry;
use crate::repositories::{LibraryRepository, WatchlistRepository};

#[derive(Debug, Deserialize)]
struct ArtistSyncPayload {
    artist_key: String,
    #[serde(default)]
    force: bool,
}

pub struct ArtistSyncHandler {
    library: Arc<dyn LibraryRepository>,
    watchlist: Arc<dyn WatchlistRepository>,
    locks: ArtistLockRegistry,
    gateway: Arc<ProviderGateway>,
    cache: Arc<ResponseCache>,
    reconcile: ReconcileConfig,
}

impl ArtistSyncHandler {
    pub fn new(
        library: Arc<dyn LibraryRepository>,
        watchlist: Arc<dyn WatchlistRepository>,
        locks: ArtistLockRegistry,
        gateway: Arc<ProviderGateway>,
        cache: Arc<ResponseCache>,
        reconcile: ReconcileConfig,
    ) -> Self {
        Self {
            library,
            watchlist,
            locks,
            gateway,
            cache,
            reconcile,
        }
    }

    async fn sync(&self, ctx: &JobContext, artist_key: &ArtistKey, force: bool) -> Result<HandlerOutcome> {
        let fetched = match self.gateway.get_artist_albums(&artist_key.source_id).await {
            Ok(fetched) => fetched,
            Err(error) => {
                self.watchlist.decrement_budget(artist_key).await.ok();
                return Ok(classify(error));
            }
        };

        let fingerprint = payload_fingerprint(&fetched);
        let now = Utc::now();

        let mut incoming_artist = Artist::new(artist_key.clone(), fetched.artist.name.clone());
        incoming_artist.external_ids = fetched.artist.external_ids.clone();
        incoming_artist.etag_fingerprint = Some(fingerprint.clone());

        let incoming_releases: Vec<Release> = fetched
            .releases
            .iter()
            .map(|release| to_release(artist_key, release))
            .collect();

        let (current_artist, just_created) = match self.library.get_artist(artist_key).await? {
            Some(artist) => (artist, false),
            None => {
                self.library
                    .create_artist(&incoming_artist, Some(ctx.job_id))
                    .await?;
                (incoming_artist.clone(), true)
            }
        };

        if !force
            && !just_created
            && current_artist.etag_fingerprint.as_deref() == Some(fingerprint.as_str())
        {
            debug!(
                target: "handlers",
                artist_key = %artist_key,
                "provider payload unchanged, skipping reconciliation"
            );
            self.watchlist.mark_synced(artist_key, now).await?;
            return Ok(HandlerOutcome::success());
        }

        let current_releases = self.library.list_releases(artist_key, true).await?;
        let delta = diff(
            &current_artist,
            &current_releases,
            &incoming_artist,
            &incoming_releases,
            DeltaPolicy {
                prune: self.reconcile.prune,
                hard_delete: self.reconcile.hard_delete,
            },
            now,
        );

        let audits = if delta.is_empty() {
            0
        } else {
            self.library
                .apply_delta(artist_key, &delta, Some(ctx.job_id), now)
                .await?
        };

        // invalidation must complete before the job commits (write-through)
        self.cache
            .invalidate_prefix(&format!("/artists/{artist_key}"));

        self.watchlist.mark_synced(artist_key, now).await?;

        info!(
            target: "handlers",
            event = "worker.job",
            job_id = %ctx.job_id,
            artist_key = %artist_key,
            releases = incoming_releases.len(),
            ops = delta.release_ops.len(),
            audits,
            status = "ok",
        );
        Ok(HandlerOutcome::success())
    }
}

#[async_trait::async_trait]
impl JobHandler for ArtistSyncHandler {
    fn job_type(&self) -> JobType {
        JobType::ArtistSync
    }

    async fn execute(&self, ctx: JobContext) -> Result<HandlerOutcome> {
        let payload: ArtistSyncPayload = match ctx.parse_payload() {
            Ok(payload) => payload,
            Err(error) => return Ok(HandlerOutcome::permanent(format!("bad payload: {error}"))),
        };
        let Some(artist_key) = ArtistKey::parse_str(&payload.artist_key) else {
            return Ok(HandlerOutcome::permanent(format!(
                "invalid artist key: {}",
                payload.artist_key
            )));
        };

        // one sync per artist at a time; contenders come back later
        let Some(_guard) = self.locks.try_acquire(&artist_key) else {
            return Ok(HandlerOutcome::retryable(format!(
                "artist {artist_key} is being synced by another job"
            )));
        };

        self.sync(&ctx, &artist_key, payload.force).await
    }
}

fn classify(error: ProviderError) -> HandlerOutcome {
    if error.is_retryable() {
        HandlerOutcome::retryable(error.to_string())
    } else {
        HandlerOutcome::permanent(error.to_string())
    }
}

fn to_release(artist_key: &ArtistKey, release: &ProviderRelease) -> Release {
    let mut out = Release::new(
        artist_key.clone(),
        release.title.clone(),
        release
            .release_type
            .as_deref()
            .map(ReleaseType::parse_str)
            .unwrap_or(ReleaseType::Album),
    );
    out.source_id = Some(release.id.clone());
    out.release_date = release
        .release_date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
    out.track_count = release.track_count;
    out
}

/// Stable digest of the provider payload; unchanged payloads short-circuit
/// the diff.
fn payload_fingerprint(fetched: &harmony_providers::ArtistWithReleases) -> String {
    let serialized = serde_json::to_string(fetched).unwrap_or_default();
    let digest = Sha256::digest(serialized.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use harmony_providers::{ArtistWithReleases, ProviderArtist};

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let fetched = ArtistWithReleases {
            artist: ProviderArtist {
                id: "abc".to_string(),
                name: "Radiohead".to_string(),
                external_ids: Default::default(),
            },
            releases: vec![],
        };
        let a = payload_fingerprint(&fetched);
        let b = payload_fingerprint(&fetched);
        assert_eq!(a, b);

        let mut changed = fetched.clone();
        changed.artist.name = "Radio Head".to_string();
        assert_ne!(a, payload_fingerprint(&changed));
    }

    #[test]
    fn provider_release_mapping() {
        let key = ArtistKey::new("spotify", "abc");
        let release = ProviderRelease {
            id: "rel-1".to_string(),
            title: "OK Computer".to_string(),
            release_type: Some("Album".to_string()),
            release_date: Some("1997-05-21".to_string()),
            track_count: Some(12),
        };
        let mapped = to_release(&key, &release);
        assert_eq!(mapped.source_id.as_deref(), Some("rel-1"));
        assert_eq!(mapped.release_type, ReleaseType::Album);
        assert_eq!(
            mapped.release_date,
            NaiveDate::from_ymd_opt(1997, 5, 21)
        );
    }
}
