// SPDX-License-Identifier: GPL-3.0-or-later

//! Dispatcher: bounded execution of leased jobs.
//!
//! Capacity is a global semaphore plus one pool per job type. Each
//! accepted job runs in its own task under a child cancellation token,
//! with a heartbeat extending the lease at half the visibility timeout.
//! Handler outcomes become queue transitions; shared plumbing (heartbeat,
//! timeout, cancellation) lives here so handlers stay plain functions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use harmony_application::{
    EventPublisher, HandlerOutcome, HandlerRegistry, JobContext, RetryPolicyProvider,
};
use harmony_domain::{DomainEvent, JobType};
use harmony_queue::{FailOutcome, JobQueue, LeasedJob, QueueError};
use serde_json::json;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of offering a leased job to the dispatcher.
pub enum DispatchResult {
    Accepted,
    /// No slot in the job type's pool; the scheduler holds the job until
    /// capacity frees.
    Deferred(LeasedJob),
}

pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    registry: Arc<HandlerRegistry>,
    retry_policies: Arc<RetryPolicyProvider>,
    events: Arc<dyn EventPublisher>,
    global: Arc<Semaphore>,
    pools: HashMap<JobType, Arc<Semaphore>>,
    lease_duration: ChronoDuration,
    heartbeat: std::time::Duration,
    root_cancel: CancellationToken,
    capacity_freed: Arc<Notify>,
    accepting: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        registry: Arc<HandlerRegistry>,
        retry_policies: Arc<RetryPolicyProvider>,
        events: Arc<dyn EventPublisher>,
        config: &harmony_config::OrchestratorConfig,
    ) -> Self {
        let mut pools = HashMap::new();
        for job_type in registry.registered_types() {
            pools.insert(
                job_type,
                Arc::new(Semaphore::new(config.pool_size(job_type.as_str()))),
            );
        }

        let lease_duration = ChronoDuration::seconds(config.visibility_timeout_s.max(1) as i64);
        let heartbeat = match config.heartbeat_s {
            Some(seconds) => std::time::Duration::from_secs(seconds.max(1)),
            None => std::time::Duration::from_secs((config.visibility_timeout_s / 2).max(1)),
        };

        Self {
            queue,
            registry,
            retry_policies,
            events,
            global: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            pools,
            lease_duration,
            heartbeat,
            root_cancel: CancellationToken::new(),
            capacity_freed: Arc::new(Notify::new()),
            accepting: AtomicBool::new(true),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn lease_duration(&self) -> ChronoDuration {
        self.lease_duration
    }

    /// Free global slots right now; the scheduler leases at most this many.
    pub fn available_capacity(&self) -> usize {
        self.global.available_permits()
    }

    /// Resolves when a slot frees after a job finishes.
    pub async fn capacity_freed(&self) {
        self.capacity_freed.notified().await;
    }

    pub async fn dispatch(self: Arc<Self>, leased: LeasedJob) -> DispatchResult {
        if !self.accepting.load(Ordering::SeqCst) {
            return DispatchResult::Deferred(leased);
        }

        let Ok(global_permit) = self.global.clone().try_acquire_owned() else {
            return DispatchResult::Deferred(leased);
        };
        let Some(pool) = self.pools.get(&leased.job.job_type).cloned() else {
            // no handler registered for this type; leave it for reaping
            warn!(
                target: "orchestrator",
                job_type = %leased.job.job_type,
                "no pool for leased job type"
            );
            return DispatchResult::Deferred(leased);
        };
        let Ok(pool_permit) = pool.try_acquire_owned() else {
            drop(global_permit);
            self.capacity_freed.notify_waiters();
            return DispatchResult::Deferred(leased);
        };

        let dispatcher = self.clone();
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(async move {
            let _global_permit = global_permit;
            let _pool_permit = pool_permit;
            dispatcher.run_job(leased).await;
            dispatcher.capacity_freed.notify_waiters();
        });

        DispatchResult::Accepted
    }

    async fn run_job(&self, leased: LeasedJob) {
        let job = &leased.job;
        let job_id = job.id;
        let job_type = job.job_type;
        let attempt = job.attempts;
        let started = std::time::Instant::now();

        self.emit(
            "orchestrator.dispatch",
            json!({ "job_id": job_id, "type": job_type, "attempt": attempt }),
        );

        let Some(handler) = self.registry.get(job_type) else {
            // nothing can run this job; dead-letter it rather than loop
            let retry_at = Utc::now();
            let _ = self
                .queue
                .fail(job_id, leased.lease_token, "no handler registered", false, 0, retry_at)
                .await;
            self.emit(
                "orchestrator.dead",
                json!({ "job_id": job_id, "type": job_type, "reason": "no handler registered" }),
            );
            return;
        };

        let cancellation = self.root_cancel.child_token();
        let ctx = JobContext {
            job_id,
            job_type,
            attempt,
            payload: job.payload.clone(),
            cancellation: cancellation.clone(),
        };

        // heartbeat at half the lease; loss of the lease cancels the task
        let heartbeat_handle = {
            let queue = self.queue.clone();
            let events = self.events.clone();
            let lease_duration = self.lease_duration;
            let interval = self.heartbeat;
            let lease_token = leased.lease_token;
            let cancellation = cancellation.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancellation.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    let lease_until = Utc::now() + lease_duration;
                    match queue.heartbeat(job_id, lease_token, lease_until).await {
                        Ok(()) => {}
                        Err(QueueError::LeaseLost(_)) => {
                            warn!(
                                target: "orchestrator",
                                event = "orchestrator.lease.lost",
                                job_id = %job_id,
                                "heartbeat lost the lease, cancelling task"
                            );
                            events.publish(&DomainEvent::new(
                                "orchestrator.lease.lost",
                                json!({ "job_id": job_id, "type": job_type }),
                            ));
                            cancellation.cancel();
                            break;
                        }
                        Err(error) => {
                            warn!(target: "orchestrator", job_id = %job_id, %error, "heartbeat error");
                        }
                    }
                }
            })
        };

        let policy = self.retry_policies.get(job_type);
        let execution = handler.execute(ctx);
        let outcome = match policy.timeout_seconds {
            Some(seconds) => {
                match tokio::time::timeout(std::time::Duration::from_secs(seconds), execution).await
                {
                    Ok(result) => result,
                    Err(_) => Ok(HandlerOutcome::retryable(format!(
                        "handler exceeded {seconds}s timeout"
                    ))),
                }
            }
            None => execution.await,
        };

        cancellation.cancel();
        heartbeat_handle.abort();

        let duration_ms = started.elapsed().as_millis() as u64;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            // an uncategorized error is treated as transient
            Err(error) => HandlerOutcome::retryable(format!("handler error: {error:#}")),
        };

        match outcome {
            HandlerOutcome::Success { skipped } => {
                match self.queue.commit(job_id, leased.lease_token).await {
                    Ok(()) => {
                        info!(
                            target: "orchestrator",
                            event = "orchestrator.commit",
                            job_id = %job_id,
                            job_type = %job_type,
                            attempt,
                            skipped,
                            duration_ms,
                            status = "ok",
                        );
                        self.emit(
                            "orchestrator.commit",
                            json!({
                                "job_id": job_id,
                                "type": job_type,
                                "attempt": attempt,
                                "skipped": skipped,
                                "duration_ms": duration_ms,
                            }),
                        );
                    }
                    Err(QueueError::LeaseLost(_)) => {
                        self.emit(
                            "orchestrator.lease.lost",
                            json!({ "job_id": job_id, "type": job_type, "at": "commit" }),
                        );
                    }
                    Err(error) => {
                        warn!(target: "orchestrator", job_id = %job_id, %error, "commit failed");
                    }
                }
            }
            HandlerOutcome::Retryable { error } => {
                let retry_at = self
                    .retry_policies
                    .next_retry_at(job_type, attempt, Utc::now());
                match self
                    .queue
                    .fail(
                        job_id,
                        leased.lease_token,
                        &error,
                        true,
                        policy.max_attempts,
                        retry_at,
                    )
                    .await
                {
                    Ok(FailOutcome::Retried { available_at }) => {
                        info!(
                            target: "orchestrator",
                            event = "orchestrator.retry",
                            job_id = %job_id,
                            job_type = %job_type,
                            attempt,
                            duration_ms,
                            available_at = %available_at,
                            error,
                            status = "retry",
                        );
                        self.emit(
                            "orchestrator.retry",
                            json!({
                                "job_id": job_id,
                                "type": job_type,
                                "attempt": attempt,
                                "available_at": available_at,
                                "error": error,
                            }),
                        );
                    }
                    Ok(FailOutcome::Dead) => self.emit_dead(job_id, job_type, attempt, &error),
                    Err(QueueError::LeaseLost(_)) => {
                        self.emit(
                            "orchestrator.lease.lost",
                            json!({ "job_id": job_id, "type": job_type, "at": "fail" }),
                        );
                    }
                    Err(queue_error) => {
                        warn!(target: "orchestrator", job_id = %job_id, %queue_error, "fail() errored");
                    }
                }
            }
            HandlerOutcome::Permanent { error } => {
                match self
                    .queue
                    .fail(
                        job_id,
                        leased.lease_token,
                        &error,
                        false,
                        policy.max_attempts,
                        Utc::now(),
                    )
                    .await
                {
                    Ok(_) => self.emit_dead(job_id, job_type, attempt, &error),
                    Err(QueueError::LeaseLost(_)) => {
                        self.emit(
                            "orchestrator.lease.lost",
                            json!({ "job_id": job_id, "type": job_type, "at": "fail" }),
                        );
                    }
                    Err(queue_error) => {
                        warn!(target: "orchestrator", job_id = %job_id, %queue_error, "fail() errored");
                    }
                }
            }
        }
    }

    fn emit_dead(&self, job_id: harmony_domain::JobId, job_type: JobType, attempt: u32, error: &str) {
        warn!(
            target: "orchestrator",
            event = "orchestrator.dead",
            job_id = %job_id,
            job_type = %job_type,
            attempt,
            error,
            status = "dead",
        );
        self.emit(
            "orchestrator.dead",
            json!({ "job_id": job_id, "type": job_type, "attempt": attempt, "error": error }),
        );
    }

    fn emit(&self, name: &'static str, payload: serde_json::Value) {
        self.events.publish(&DomainEvent::new(name, payload));
    }

    /// Stop accepting, drain in-flight work for `grace`, then cancel the
    /// rest and let the queue reaper restore their leases.
    pub async fn shutdown(&self, grace: std::time::Duration) {
        self.accepting.store(false, Ordering::SeqCst);

        let drain = async {
            let mut tasks = self.tasks.lock().await;
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(target: "orchestrator", "grace period elapsed, cancelling in-flight jobs");
            self.root_cancel.cancel();
            let mut tasks = self.tasks.lock().await;
            let drain_rest = async {
                while tasks.join_next().await.is_some() {}
            };
            if tokio::time::timeout(std::time::Duration::from_secs(5), drain_rest)
                .await
                .is_err()
            {
                tasks.abort_all();
            }
        }
        info!(target: "orchestrator", "dispatcher stopped");
    }
}
