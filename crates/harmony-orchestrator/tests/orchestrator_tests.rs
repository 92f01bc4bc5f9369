// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use harmony_application::{
    AppState, HandlerOutcome, HandlerRegistry, InMemoryEventBus, JobContext, JobHandler,
    WatchlistRepository,
};
use harmony_config::AppConfig;
use harmony_domain::{ArtistKey, JobId, JobState, JobType, WatchlistEntry};
use harmony_orchestrator::{Orchestrator, WatchlistTimer};
use harmony_queue::{EnqueueOptions, JobQueue};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tempfile::TempDir;

fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.orchestrator.poll_interval_ms = 10;
    config.orchestrator.poll_interval_max_ms = 50;
    config.orchestrator.visibility_timeout_s = 5;
    config.orchestrator.reap_interval_s = 1;
    config.watchlist.shutdown_grace_ms = 500;
    config.retry.base_seconds = 0.05;
    config.retry.jitter_pct = 0.0;
    config
}

async fn test_pool() -> (SqlitePool, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let db_path = dir.path().join("harmony.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect");
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .expect("migrate");
    (pool, dir)
}

/// Pops scripted outcomes per execution; repeats the last one forever.
struct ScriptedHandler {
    job_type: JobType,
    outcomes: Mutex<VecDeque<HandlerOutcome>>,
    log: Arc<Mutex<Vec<(JobId, JobType, u32)>>>,
    delay: std::time::Duration,
}

impl ScriptedHandler {
    fn new(
        job_type: JobType,
        outcomes: Vec<HandlerOutcome>,
        log: Arc<Mutex<Vec<(JobId, JobType, u32)>>>,
    ) -> Self {
        Self {
            job_type,
            outcomes: Mutex::new(outcomes.into()),
            log,
            delay: std::time::Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait::async_trait]
impl JobHandler for ScriptedHandler {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn execute(&self, ctx: JobContext) -> anyhow::Result<HandlerOutcome> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log
            .lock()
            .unwrap()
            .push((ctx.job_id, ctx.job_type, ctx.attempt));

        let mut outcomes = self.outcomes.lock().unwrap();
        let outcome = if outcomes.len() > 1 {
            outcomes.pop_front().unwrap()
        } else {
            outcomes
                .front()
                .cloned()
                .unwrap_or(HandlerOutcome::success())
        };
        Ok(outcome)
    }
}

async fn await_state(
    queue: &Arc<dyn JobQueue>,
    job_id: JobId,
    wanted: JobState,
) -> harmony_domain::Job {
    for _ in 0..400 {
        if let Some(job) = queue.get_job(job_id).await.unwrap() {
            if job.state == wanted {
                return job;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    panic!("job {job_id} never reached {wanted}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retryable_failures_then_success() {
    let (pool, _dir) = test_pool().await;
    let state = AppState::new(fast_config(), pool).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(ScriptedHandler::new(
        JobType::Matching,
        vec![
            HandlerOutcome::retryable("transient one"),
            HandlerOutcome::retryable("transient two"),
            HandlerOutcome::success(),
        ],
        log.clone(),
    )));

    let outcome = state
        .queue
        .enqueue(JobType::Matching, json!({"n": 1}), EnqueueOptions::default())
        .await
        .unwrap();

    let handle = Orchestrator::with_registry(state.clone(), Arc::new(registry)).start();
    let job = await_state(&state.queue, outcome.job_id, JobState::Succeeded).await;
    handle.shutdown().await;

    assert_eq!(job.attempts, 3);
    let attempts: Vec<u32> = log.lock().unwrap().iter().map(|(_, _, a)| *a).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_dead_letter() {
    let (pool, _dir) = test_pool().await;
    let mut config = fast_config();
    config.retry.max_attempts = 2;
    let state = AppState::new(config, pool).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(ScriptedHandler::new(
        JobType::Matching,
        vec![HandlerOutcome::retryable("always failing")],
        log.clone(),
    )));

    let outcome = state
        .queue
        .enqueue(JobType::Matching, json!({"n": 1}), EnqueueOptions::default())
        .await
        .unwrap();

    let handle = Orchestrator::with_registry(state.clone(), Arc::new(registry)).start();
    let job = await_state(&state.queue, outcome.job_id, JobState::Dead).await;
    handle.shutdown().await;

    // two attempts ran, never a third
    assert_eq!(job.attempts, 2);
    assert_eq!(log.lock().unwrap().len(), 2);

    let dead = state.queue.list_dead_letters(10, 0).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_id, outcome.job_id);
    assert_eq!(dead[0].reason, "always failing");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn permanent_failure_dead_letters_immediately() {
    let (pool, _dir) = test_pool().await;
    let state = AppState::new(fast_config(), pool).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(ScriptedHandler::new(
        JobType::Matching,
        vec![HandlerOutcome::permanent("schema violation")],
        log.clone(),
    )));

    let outcome = state
        .queue
        .enqueue(JobType::Matching, json!({"n": 1}), EnqueueOptions::default())
        .await
        .unwrap();

    let handle = Orchestrator::with_registry(state.clone(), Arc::new(registry)).start();
    let job = await_state(&state.queue, outcome.job_id, JobState::Dead).await;
    handle.shutdown().await;

    assert_eq!(job.attempts, 1);
    let dead = state.queue.list_dead_letters(10, 0).await.unwrap();
    assert_eq!(dead[0].reason, "schema violation");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn priority_order_execution() {
    let (pool, _dir) = test_pool().await;
    let mut config = fast_config();
    // one worker at a time surfaces the weighted order
    config.orchestrator.global_concurrency = 1;
    let state = AppState::new(config, pool).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut registry = HandlerRegistry::new();
    for job_type in [JobType::Sync, JobType::Matching, JobType::Watchlist] {
        registry.register(Arc::new(ScriptedHandler::new(
            job_type,
            vec![HandlerOutcome::success()],
            log.clone(),
        )));
    }

    let watchlist = state
        .queue
        .enqueue(JobType::Watchlist, json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let sync = state
        .queue
        .enqueue(JobType::Sync, json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let matching = state
        .queue
        .enqueue(JobType::Matching, json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let handle = Orchestrator::with_registry(state.clone(), Arc::new(registry)).start();
    await_state(&state.queue, watchlist.job_id, JobState::Succeeded).await;
    await_state(&state.queue, sync.job_id, JobState::Succeeded).await;
    await_state(&state.queue, matching.job_id, JobState::Succeeded).await;
    handle.shutdown().await;

    let order: Vec<JobType> = log.lock().unwrap().iter().map(|(_, t, _)| *t).collect();
    assert_eq!(
        order,
        vec![JobType::Sync, JobType::Matching, JobType::Watchlist]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timer_collapses_enqueues_within_one_interval() {
    let (pool, _dir) = test_pool().await;
    let state = AppState::new(fast_config(), pool).unwrap();
    let bus = Arc::new(InMemoryEventBus::new());

    let key = ArtistKey::new("spotify", "abc");
    state
        .watchlist
        .upsert(WatchlistEntry::new(key.clone(), 5))
        .await
        .unwrap();

    let timer = WatchlistTimer::new(
        state.watchlist.clone(),
        state.queue.clone(),
        bus.clone(),
        state.config.watchlist.clone(),
    );

    let first = timer.tick().await.unwrap();
    assert_eq!(first.considered, 1);
    assert_eq!(first.enqueued, 1);
    assert_eq!(first.skipped, 0);

    // same interval bucket: the enqueue is collapsed
    let second = timer.tick().await.unwrap();
    assert_eq!(second.enqueued, 0);
    assert_eq!(second.skipped, 1);

    let pending = state
        .queue
        .list_jobs(Some(JobState::Pending), Some(JobType::Watchlist), 10, 0)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    assert_eq!(bus.named("orchestrator.timer.tick").len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timer_respects_per_tick_cap() {
    let (pool, _dir) = test_pool().await;
    let mut config = fast_config();
    config.watchlist.max_per_tick = 2;
    let state = AppState::new(config, pool).unwrap();
    let bus = Arc::new(InMemoryEventBus::new());

    for i in 0..5 {
        state
            .watchlist
            .upsert(WatchlistEntry::new(ArtistKey::new("spotify", format!("a{i}")), 5))
            .await
            .unwrap();
    }

    let timer = WatchlistTimer::new(
        state.watchlist.clone(),
        state.queue.clone(),
        bus,
        state.config.watchlist.clone(),
    );
    let tick = timer.tick().await.unwrap();
    assert_eq!(tick.considered, 2);
    assert_eq!(tick.enqueued, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_deferral_still_drains_all_jobs() {
    let (pool, _dir) = test_pool().await;
    let mut config = fast_config();
    config.orchestrator.pools.insert("matching".to_string(), 1);
    let state = AppState::new(config, pool).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(
        ScriptedHandler::new(JobType::Matching, vec![HandlerOutcome::success()], log.clone())
            .with_delay(std::time::Duration::from_millis(50)),
    ));

    let mut job_ids = Vec::new();
    for i in 0..4 {
        let outcome = state
            .queue
            .enqueue(JobType::Matching, json!({"n": i}), EnqueueOptions::default())
            .await
            .unwrap();
        job_ids.push(outcome.job_id);
    }

    let handle = Orchestrator::with_registry(state.clone(), Arc::new(registry)).start();
    for job_id in &job_ids {
        await_state(&state.queue, *job_id, JobState::Succeeded).await;
    }
    handle.shutdown().await;

    // single-width pool serialized the executions
    assert_eq!(log.lock().unwrap().len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_with_idle_queue_is_clean() {
    let (pool, _dir) = test_pool().await;
    let state = AppState::new(fast_config(), pool).unwrap();

    let handle = Orchestrator::with_registry(state, Arc::new(HandlerRegistry::new())).start();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    handle.shutdown().await;
}
