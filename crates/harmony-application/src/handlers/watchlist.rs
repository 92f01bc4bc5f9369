// SPDX-License-Identifier: GPL-3.0-or-later

//! Watchlist job: gate an artist on its retry budget, then fan out an
//! `artist_sync` job.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use harmony_config::WatchlistConfig;
use harmony_domain::{ArtistKey, JobType};
use harmony_queue::{EnqueueOptions, JobQueue};
use serde::Deserialize;
use tracing::{info, warn};

use crate::handlers::{HandlerOutcome, JobContext, JobHandler};
use crate::repositories::WatchlistRepository;

#[derive(Debug, Deserialize)]
struct WatchlistPayload {
    artist_key: String,
}

pub struct WatchlistHandler {
    watchlist: Arc<dyn WatchlistRepository>,
    queue: Arc<dyn JobQueue>,
    config: WatchlistConfig,
}

impl WatchlistHandler {
    pub fn new(
        watchlist: Arc<dyn WatchlistRepository>,
        queue: Arc<dyn JobQueue>,
        config: WatchlistConfig,
    ) -> Self {
        Self {
            watchlist,
            queue,
            config,
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for WatchlistHandler {
    fn job_type(&self) -> JobType {
        JobType::Watchlist
    }

    async fn execute(&self, ctx: JobContext) -> Result<HandlerOutcome> {
        let payload: WatchlistPayload = match ctx.parse_payload() {
            Ok(payload) => payload,
            Err(error) => return Ok(HandlerOutcome::permanent(format!("bad payload: {error}"))),
        };
        let Some(artist_key) = ArtistKey::parse_str(&payload.artist_key) else {
            return Ok(HandlerOutcome::permanent(format!(
                "invalid artist key: {}",
                payload.artist_key
            )));
        };

        let Some(entry) = self.watchlist.get(&artist_key).await? else {
            return Ok(HandlerOutcome::permanent(format!(
                "watchlist entry not found: {artist_key}"
            )));
        };

        let now = Utc::now();

        // budget spent: park the artist instead of hammering the provider
        if entry.retry_budget_remaining <= 0 {
            let until = now + Duration::seconds(self.config.artist_cooldown_s as i64);
            self.watchlist
                .set_cooldown(&artist_key, until, self.config.retry_budget)
                .await?;
            warn!(
                target: "handlers",
                event = "worker.job",
                job_id = %ctx.job_id,
                artist_key = %artist_key,
                status = "skipped",
                reason = "budget_exhausted",
                cooldown_until = %until,
            );
            return Ok(HandlerOutcome::skipped());
        }

        let outcome = self
            .queue
            .enqueue(
                JobType::ArtistSync,
                serde_json::json!({ "artist_key": artist_key.to_string() }),
                EnqueueOptions {
                    idempotency_key: Some(format!("artist_sync:{artist_key}")),
                    ..Default::default()
                },
            )
            .await?;

        self.watchlist.mark_synced(&artist_key, now).await?;

        info!(
            target: "handlers",
            event = "worker.job",
            job_id = %ctx.job_id,
            artist_key = %artist_key,
            enqueued_job_id = %outcome.job_id,
            deduplicated = outcome.deduplicated,
            status = "ok",
        );
        Ok(HandlerOutcome::success())
    }
}
