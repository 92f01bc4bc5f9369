// SPDX-License-Identifier: GPL-3.0-or-later

//! Scheduler: the single cooperative lease loop.
//!
//! Each tick leases up to the dispatcher's free capacity in weighted
//! priority order. An empty lease doubles the poll interval up to the
//! cap; work resets it to the floor. Jobs the dispatcher defers (full
//! type pool) are held here and offered again before any new lease, and
//! the loop waits for capacity instead of re-polling while they wait.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use harmony_application::EventPublisher;
use harmony_domain::{DomainEvent, JobType};
use harmony_queue::JobQueue;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchResult, Dispatcher};

pub struct Scheduler {
    queue: Arc<dyn JobQueue>,
    dispatcher: Arc<Dispatcher>,
    events: Arc<dyn EventPublisher>,
    types: Vec<JobType>,
    poll_floor_ms: u64,
    poll_max_ms: u64,
}

impl Scheduler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        dispatcher: Arc<Dispatcher>,
        events: Arc<dyn EventPublisher>,
        types: Vec<JobType>,
        config: &harmony_config::OrchestratorConfig,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            events,
            types,
            poll_floor_ms: config.poll_floor_ms(),
            poll_max_ms: config.poll_interval_max_ms.max(config.poll_floor_ms()),
        }
    }

    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(
            target: "orchestrator",
            types = ?self.types.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            "scheduler started"
        );

        let mut poll_ms = self.poll_floor_ms;
        let mut deferred: VecDeque<harmony_queue::LeasedJob> = VecDeque::new();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(poll_ms)) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }

            // deferred jobs go first; their lease clock is already running
            while let Some(job) = deferred.pop_front() {
                match self.dispatcher.clone().dispatch(job).await {
                    DispatchResult::Accepted => {}
                    DispatchResult::Deferred(job) => {
                        deferred.push_front(job);
                        break;
                    }
                }
            }
            if !deferred.is_empty() {
                // full pools: wait for a slot instead of re-polling (the
                // sleep arm covers a slot freed before we started waiting)
                tokio::select! {
                    _ = self.dispatcher.capacity_freed() => {}
                    _ = tokio::time::sleep(std::time::Duration::from_millis(self.poll_max_ms)) => {}
                    _ = stop.changed() => {}
                }
                continue;
            }

            let capacity = self.dispatcher.available_capacity();
            if capacity == 0 {
                tokio::select! {
                    _ = self.dispatcher.capacity_freed() => {}
                    _ = tokio::time::sleep(std::time::Duration::from_millis(self.poll_max_ms)) => {}
                    _ = stop.changed() => {}
                }
                continue;
            }

            let now = Utc::now();
            let leased = match self
                .queue
                .lease(
                    &self.types,
                    now,
                    self.dispatcher.lease_duration(),
                    capacity as u32,
                )
                .await
            {
                Ok(leased) => leased,
                Err(error) => {
                    warn!(target: "orchestrator", %error, "lease failed");
                    poll_ms = (poll_ms * 2).min(self.poll_max_ms);
                    continue;
                }
            };

            if leased.is_empty() {
                poll_ms = (poll_ms * 2).min(self.poll_max_ms);
                continue;
            }

            debug!(
                target: "orchestrator",
                event = "orchestrator.schedule",
                leased = leased.len(),
                capacity,
            );
            self.events.publish(&DomainEvent::new(
                "orchestrator.schedule",
                json!({ "leased": leased.len(), "capacity": capacity }),
            ));

            for job in leased {
                match self.dispatcher.clone().dispatch(job).await {
                    DispatchResult::Accepted => {}
                    DispatchResult::Deferred(job) => deferred.push_back(job),
                }
            }
            poll_ms = self.poll_floor_ms;
        }

        // outstanding deferred leases simply expire and get reaped
        if !deferred.is_empty() {
            info!(
                target: "orchestrator",
                deferred = deferred.len(),
                "scheduler stopping with deferred jobs, leaving them to the reaper"
            );
        }
        info!(target: "orchestrator", "scheduler stopped");
    }
}
