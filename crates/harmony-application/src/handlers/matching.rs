// SPDX-License-Identifier: GPL-3.0-or-later

//! Matching job: search the peer network for a wanted track and persist
//! the best candidate above the confidence threshold.

use std::sync::Arc;

use anyhow::Result;
use harmony_config::MatchingConfig;
use harmony_domain::{
    DownloadFile, IngestItemId, IngestState, JobType, NormalizedTrack,
};
use harmony_providers::{ProviderError, ProviderGateway};
use harmony_queue::{EnqueueOptions, JobQueue};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::handlers::{HandlerOutcome, JobContext, JobHandler};
use crate::matching::{MatchDecision, MatchEngine};
use crate::repositories::{DownloadRepository, IngestRepository};

#[derive(Debug, Deserialize)]
struct MatchingPayload {
    /// Item produced by the ingest service.
    #[serde(default)]
    ingest_item_id: Option<Uuid>,
    /// Inline track, for callers matching outside an ingest job.
    #[serde(default)]
    track: Option<NormalizedTrack>,
}

pub struct MatchingHandler {
    ingest: Arc<dyn IngestRepository>,
    downloads: Arc<dyn DownloadRepository>,
    queue: Arc<dyn JobQueue>,
    gateway: Arc<ProviderGateway>,
    engine: MatchEngine,
}

impl MatchingHandler {
    pub fn new(
        ingest: Arc<dyn IngestRepository>,
        downloads: Arc<dyn DownloadRepository>,
        queue: Arc<dyn JobQueue>,
        gateway: Arc<ProviderGateway>,
        config: &MatchingConfig,
    ) -> Self {
        Self {
            ingest,
            downloads,
            queue,
            gateway,
            engine: MatchEngine::new(config.confidence_threshold, config.preferred_formats.clone()),
        }
    }

    async fn resolve_track(
        &self,
        payload: &MatchingPayload,
    ) -> Result<std::result::Result<(Option<IngestItemId>, NormalizedTrack), String>> {
        if let Some(raw_id) = payload.ingest_item_id {
            let id = IngestItemId::from_uuid(raw_id);
            let Some(item) = self.ingest.get_item(id).await? else {
                return Ok(Err(format!("ingest item not found: {id}")));
            };
            let Some(track) = item.normalized else {
                return Ok(Err(format!("ingest item {id} was never normalized")));
            };
            return Ok(Ok((Some(id), track)));
        }
        if let Some(track) = payload.track.clone() {
            return Ok(Ok((None, track)));
        }
        Ok(Err("payload carries neither ingest_item_id nor track".to_string()))
    }
}

#[async_trait::async_trait]
impl JobHandler for MatchingHandler {
    fn job_type(&self) -> JobType {
        JobType::Matching
    }

    async fn execute(&self, ctx: JobContext) -> Result<HandlerOutcome> {
        let payload: MatchingPayload = match ctx.parse_payload() {
            Ok(payload) => payload,
            Err(error) => return Ok(HandlerOutcome::permanent(format!("bad payload: {error}"))),
        };

        let (item_id, mut track) = match self.resolve_track(&payload).await? {
            Ok(resolved) => resolved,
            Err(reason) => return Ok(HandlerOutcome::permanent(reason)),
        };

        // an ISRC hit gives canonical title/duration to score against
        if let Some(isrc) = track.isrc.clone() {
            match self.gateway.get_track_by_isrc(&isrc).await {
                Ok(Some(reference)) => {
                    track.title = reference.title;
                    track.artist = reference.artist;
                    if track.album.is_none() {
                        track.album = reference.album;
                    }
                    if reference.duration_secs.is_some() {
                        track.duration_secs = reference.duration_secs;
                    }
                }
                Ok(None) => {}
                Err(error) if error.is_retryable() => {
                    return Ok(HandlerOutcome::retryable(error.to_string()))
                }
                Err(_) => {}
            }
        }

        let query = format!("{} {}", track.artist, track.title);
        let results = match self.gateway.search_peer(&query).await {
            Ok(results) => results,
            Err(error) => return Ok(classify(error)),
        };

        let outcome = self.engine.evaluate(&track, &results);
        let (stored, discarded) = match outcome.decision {
            MatchDecision::Accepted => (1, outcome.considered.saturating_sub(1)),
            _ => (0, outcome.considered),
        };
        info!(
            target: "handlers",
            event = "matching.batch",
            job_id = %ctx.job_id,
            stored,
            discarded,
            average_confidence = outcome.average_confidence,
        );

        match outcome.decision {
            MatchDecision::Accepted => {
                let best = outcome.best.expect("accepted outcome has a candidate");

                let mut file = DownloadFile::new(best.username.clone(), best.file.filename.clone());
                file.size_bytes = best.file.size_bytes;
                self.downloads.insert_files(std::slice::from_ref(&file)).await?;

                let mut sync_payload = serde_json::json!({
                    "peer_username": best.username,
                    "files": [{
                        "filename": best.file.filename,
                        "size_bytes": best.file.size_bytes,
                    }],
                    "download_file_ids": [file.id],
                });
                if let Some(item_id) = item_id {
                    sync_payload["ingest_item_id"] = serde_json::json!(item_id);
                }

                let enqueued = self
                    .queue
                    .enqueue(
                        JobType::Sync,
                        sync_payload,
                        EnqueueOptions {
                            idempotency_key: Some(format!(
                                "sync:{}:{}",
                                best.username, best.file.filename
                            )),
                            ..Default::default()
                        },
                    )
                    .await?;

                self.downloads.mark_requeued(file.id, enqueued.job_id).await?;

                // the item already sits in `queued`; only record which sync
                // job owns it
                if let Some(item_id) = item_id {
                    self.ingest.set_download_job(item_id, enqueued.job_id).await?;
                }
                Ok(HandlerOutcome::success())
            }
            MatchDecision::BelowThreshold { best } => {
                if let Some(item_id) = item_id {
                    self.ingest
                        .advance_item(
                            item_id,
                            IngestState::Completed,
                            Some(format!("no candidate above threshold (best: {best})")),
                            None,
                        )
                        .await?;
                }
                Ok(HandlerOutcome::skipped())
            }
            MatchDecision::NoCandidates => {
                if let Some(item_id) = item_id {
                    self.ingest
                        .advance_item(
                            item_id,
                            IngestState::Completed,
                            Some("peer search returned no candidates".to_string()),
                            None,
                        )
                        .await?;
                }
                Ok(HandlerOutcome::skipped())
            }
        }
    }
}

fn classify(error: ProviderError) -> HandlerOutcome {
    if error.is_retryable() {
        HandlerOutcome::retryable(error.to_string())
    } else {
        HandlerOutcome::permanent(error.to_string())
    }
}
