// SPDX-License-Identifier: GPL-3.0-or-later

//! Watchlist timer: periodically turns due watchlist entries into
//! `watchlist` jobs.
//!
//! The idempotency key buckets enqueues by timer interval, so however
//! many ticks or processes race within one interval, at most one
//! `watchlist` job per artist becomes pending.

use std::sync::Arc;

use chrono::Utc;
use harmony_application::{EventPublisher, WatchlistRepository};
use harmony_config::WatchlistConfig;
use harmony_domain::{DomainEvent, JobType};
use harmony_queue::{EnqueueOptions, JobQueue};
use serde_json::json;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerTick {
    pub considered: usize,
    pub enqueued: usize,
    pub skipped: usize,
}

pub struct WatchlistTimer {
    watchlist: Arc<dyn WatchlistRepository>,
    queue: Arc<dyn JobQueue>,
    events: Arc<dyn EventPublisher>,
    config: WatchlistConfig,
    /// Held across a tick; a tick that finds it taken reports `busy`.
    running: Mutex<()>,
}

impl WatchlistTimer {
    pub fn new(
        watchlist: Arc<dyn WatchlistRepository>,
        queue: Arc<dyn JobQueue>,
        events: Arc<dyn EventPublisher>,
        config: WatchlistConfig,
    ) -> Self {
        Self {
            watchlist,
            queue,
            events,
            config,
            running: Mutex::new(()),
        }
    }

    /// One timer pass. Public so operators (and tests) can force a tick.
    pub async fn tick(&self) -> anyhow::Result<TimerTick> {
        let Ok(_running) = self.running.try_lock() else {
            warn!(
                target: "orchestrator",
                event = "orchestrator.timer.tick",
                status = "skipped",
                reason = "busy",
            );
            return Ok(TimerTick::default());
        };

        let now = Utc::now();
        let interval = self.config.timer_interval_s.max(1);
        let bucket = now.timestamp() / interval as i64;

        let due = self
            .watchlist
            .list_due(now, self.config.max_per_tick as i64)
            .await?;
        let considered = due.len();

        let mut enqueued = 0usize;
        let mut skipped = 0usize;
        for entry in due {
            let key = &entry.artist_key;
            let outcome = self
                .queue
                .enqueue(
                    JobType::Watchlist,
                    json!({ "artist_key": key.to_string() }),
                    EnqueueOptions {
                        idempotency_key: Some(format!("watchlist:{key}:{bucket}")),
                        ..Default::default()
                    },
                )
                .await?;

            if outcome.deduplicated {
                skipped += 1;
            } else {
                enqueued += 1;
                self.watchlist.mark_enqueued(key, now).await?;
            }
        }

        info!(
            target: "orchestrator",
            event = "orchestrator.timer.tick",
            considered,
            enqueued,
            skipped,
            status = "ok",
        );
        self.events.publish(&DomainEvent::new(
            "orchestrator.timer.tick",
            json!({ "considered": considered, "enqueued": enqueued, "skipped": skipped }),
        ));

        Ok(TimerTick {
            considered,
            enqueued,
            skipped,
        })
    }

    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let interval = std::time::Duration::from_secs(self.config.timer_interval_s.max(1));
        info!(target: "orchestrator", interval_s = interval.as_secs(), "watchlist timer started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }
            if let Err(error) = self.tick().await {
                warn!(target: "orchestrator", %error, "watchlist timer tick failed");
            }
        }
        info!(target: "orchestrator", "watchlist timer stopped");
    }
}
