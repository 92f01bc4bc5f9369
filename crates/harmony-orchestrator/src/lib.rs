// SPDX-License-Identifier: GPL-3.0-or-later

//! Orchestration: scheduler, dispatcher, watchlist timer, lease reaper.
//!
//! Startup order is reaper → dispatcher → scheduler → timer; shutdown
//! runs in reverse: the timer and scheduler stop first, in-flight jobs
//! get a grace period, the rest are cancelled and their leases expire
//! back into the queue.

pub mod dispatcher;
pub mod scheduler;
pub mod timer;

use std::sync::Arc;

use chrono::Utc;
use harmony_application::AppState;
use harmony_application::{EventPublisher, HandlerRegistry, TracingEventBus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use dispatcher::{DispatchResult, Dispatcher};
pub use scheduler::Scheduler;
pub use timer::{TimerTick, WatchlistTimer};

pub struct Orchestrator {
    state: AppState,
    registry: Arc<HandlerRegistry>,
    events: Arc<dyn EventPublisher>,
}

/// Running orchestrator; `shutdown` drains it.
pub struct OrchestratorHandle {
    stop_tx: watch::Sender<bool>,
    dispatcher: Arc<Dispatcher>,
    timer: Arc<WatchlistTimer>,
    tasks: Vec<JoinHandle<()>>,
    grace: std::time::Duration,
}

impl Orchestrator {
    pub fn new(state: AppState) -> Self {
        let registry = Arc::new(state.handler_registry());
        Self::with_registry(state, registry)
    }

    /// Wire an explicit handler registry instead of the default set.
    pub fn with_registry(state: AppState, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            state,
            registry,
            events: Arc::new(TracingEventBus),
        }
    }

    /// Swap the event bus (tests capture events in memory).
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn start(self) -> OrchestratorHandle {
        let (stop_tx, stop_rx) = watch::channel(false);

        let dispatcher = Arc::new(Dispatcher::new(
            self.state.queue.clone(),
            self.registry.clone(),
            self.state.retry_policies.clone(),
            self.events.clone(),
            &self.state.config.orchestrator,
        ));

        let scheduler = Scheduler::new(
            self.state.queue.clone(),
            dispatcher.clone(),
            self.events.clone(),
            self.registry.registered_types(),
            &self.state.config.orchestrator,
        );

        let timer = Arc::new(WatchlistTimer::new(
            self.state.watchlist.clone(),
            self.state.queue.clone(),
            self.events.clone(),
            self.state.config.watchlist.clone(),
        ));

        let mut tasks = Vec::new();

        // lease reaper + bounded retention
        {
            let queue = self.state.queue.clone();
            let mut stop = stop_rx.clone();
            let interval = std::time::Duration::from_secs(
                self.state.config.orchestrator.reap_interval_s.max(1),
            );
            let retention =
                chrono::Duration::seconds(self.state.config.orchestrator.succeeded_retention_s.max(60) as i64);
            tasks.push(tokio::spawn(async move {
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
                    let now = Utc::now();
                    match queue.reap(now).await {
                        Ok(reaped) if !reaped.is_empty() => {
                            warn!(target: "orchestrator", reaped = reaped.len(), "expired leases restored");
                        }
                        Ok(_) => {}
                        Err(error) => {
                            warn!(target: "orchestrator", %error, "reap failed");
                        }
                    }
                    match queue.cleanup_succeeded(now - retention).await {
                        Ok(removed) if removed > 0 => {
                            info!(target: "orchestrator", removed, "succeeded jobs past retention removed");
                        }
                        Ok(_) => {}
                        Err(error) => {
                            warn!(target: "orchestrator", %error, "retention cleanup failed");
                        }
                    }
                }
            }));
        }

        tasks.push(tokio::spawn(scheduler.run(stop_rx.clone())));
        tasks.push(tokio::spawn(timer.clone().run(stop_rx)));

        info!(target: "orchestrator", "orchestrator started");
        OrchestratorHandle {
            stop_tx,
            dispatcher,
            timer,
            tasks,
            grace: std::time::Duration::from_millis(self.state.config.watchlist.shutdown_grace_ms),
        }
    }
}

impl OrchestratorHandle {
    /// The shared timer, for operator-triggered ticks.
    pub fn timer(&self) -> Arc<WatchlistTimer> {
        self.timer.clone()
    }

    /// Graceful shutdown: stop timer and scheduler, drain the dispatcher
    /// within the grace period, cancel the rest.
    pub async fn shutdown(self) {
        info!(target: "orchestrator", "orchestrator shutting down");
        let _ = self.stop_tx.send(true);

        for task in self.tasks {
            if let Err(error) = task.await {
                if !error.is_cancelled() {
                    warn!(target: "orchestrator", %error, "orchestrator task panicked");
                }
            }
        }

        self.dispatcher.shutdown(self.grace).await;
        info!(target: "orchestrator", "orchestrator stopped");
    }
}
