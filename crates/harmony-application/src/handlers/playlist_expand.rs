// SPDX-License-Identifier: GPL-3.0-or-later

//! Playlist expansion (PRO mode): fetch a playlist link's tracks and
//! append them as expansion items of the originating ingest job.

use std::sync::Arc;

use anyhow::Result;
use harmony_config::IngestConfig;
use harmony_domain::{
    IngestItem, IngestItemId, IngestSourceType, IngestState, JobType, NormalizedTrack,
};
use harmony_providers::{ProviderError, ProviderGateway};
use harmony_queue::{EnqueueOptions, JobQueue};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::handlers::{HandlerOutcome, JobContext, JobHandler};
use crate::ingest::parse_playlist_link;
use crate::repositories::IngestRepository;
use crate::text::normalize;

#[derive(Debug, Deserialize)]
struct PlaylistExpandPayload {
    ingest_item_id: Uuid,
}

pub struct PlaylistExpandHandler {
    ingest: Arc<dyn IngestRepository>,
    queue: Arc<dyn JobQueue>,
    gateway: Arc<ProviderGateway>,
    config: IngestConfig,
}

impl PlaylistExpandHandler {
    pub fn new(
        ingest: Arc<dyn IngestRepository>,
        queue: Arc<dyn JobQueue>,
        gateway: Arc<ProviderGateway>,
        config: IngestConfig,
    ) -> Self {
        Self {
            ingest,
            queue,
            gateway,
            config,
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for PlaylistExpandHandler {
    fn job_type(&self) -> JobType {
        JobType::PlaylistExpand
    }

    async fn execute(&self, ctx: JobContext) -> Result<HandlerOutcome> {
        let payload: PlaylistExpandPayload = match ctx.parse_payload() {
            Ok(payload) => payload,
            Err(error) => return Ok(HandlerOutcome::permanent(format!("bad payload: {error}"))),
        };

        let item_id = IngestItemId::from_uuid(payload.ingest_item_id);
        let Some(link_item) = self.ingest.get_item(item_id).await? else {
            return Ok(HandlerOutcome::permanent(format!(
                "ingest item not found: {item_id}"
            )));
        };
        if link_item.source_type != IngestSourceType::Link {
            return Ok(HandlerOutcome::permanent(format!(
                "ingest item {item_id} is not a playlist link"
            )));
        }
        // replay after a crash: the parent already completed
        if link_item.state == IngestState::Completed {
            return Ok(HandlerOutcome::skipped());
        }

        let Some(playlist_id) = parse_playlist_link(&link_item.raw) else {
            self.ingest
                .advance_item(
                    item_id,
                    IngestState::Failed,
                    Some("unrecognized playlist link".to_string()),
                    None,
                )
                .await?;
            return Ok(HandlerOutcome::permanent(format!(
                "unrecognized playlist link: {}",
                link_item.raw
            )));
        };

        let playlist = match self.gateway.get_playlist(&playlist_id).await {
            Ok(playlist) => playlist,
            Err(error) => return Ok(classify(error)),
        };

        // dedup within the playlist, capped by the absolute fuse
        let hard_cap = self.config.hard_cap() as usize;
        let mut seen = std::collections::HashSet::new();
        let mut expansions: Vec<IngestItem> = Vec::new();
        for track in &playlist.tracks {
            if expansions.len() >= hard_cap {
                break;
            }
            let normalized = NormalizedTrack {
                artist: track.artist.trim().to_string(),
                title: track.title.trim().to_string(),
                album: track.album.as_deref().map(|a| a.trim().to_string()),
                duration_secs: track.duration_secs,
                isrc: track.isrc.clone(),
            };
            let dedup_key = (
                normalize(&normalized.artist),
                normalize(&normalized.title),
                normalized.album.as_deref().map(normalize),
            );
            if !seen.insert(dedup_key) {
                continue;
            }

            let mut item = IngestItem::new(
                link_item.ingest_job_id,
                IngestSourceType::LinkExpansion,
                format!("{} - {}", track.artist, track.title),
            );
            item.normalized = Some(normalized);
            item.state = IngestState::Normalized;
            expansions.push(item);
        }

        self.ingest.insert_items(&expansions).await?;

        for chunk in expansions.chunks(self.config.batch_size.max(1) as usize) {
            for item in chunk {
                self.queue
                    .enqueue(
                        JobType::Matching,
                        serde_json::json!({ "ingest_item_id": item.id }),
                        EnqueueOptions {
                            idempotency_key: Some(format!("matching:{}", item.id)),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.ingest
                    .advance_item(item.id, IngestState::Queued, None, None)
                    .await?;
            }
        }

        // the link item is done once its expansion exists
        self.ingest
            .advance_item(item_id, IngestState::Completed, None, None)
            .await?;

        if let Some(mut job) = self.ingest.get_job(link_item.ingest_job_id).await? {
            job.counts.accepted += expansions.len() as u32;
            job.counts.enqueued += expansions.len() as u32;
            self.ingest.update_job(&job).await?;
        }

        info!(
            target: "handlers",
            event = "worker.job",
            job_id = %ctx.job_id,
            playlist_id = %playlist_id,
            expanded = expansions.len(),
            status = "ok",
        );
        Ok(HandlerOutcome::success())
    }
}

fn classify(error: ProviderError) -> HandlerOutcome {
    if error.is_retryable() {
        HandlerOutcome::retryable(error.to_string())
    } else {
        HandlerOutcome::permanent(error.to_string())
    }
}
