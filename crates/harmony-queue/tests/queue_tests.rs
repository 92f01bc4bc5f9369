// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use harmony_domain::{JobId, JobState, JobType};
use harmony_queue::{EnqueueOptions, FailOutcome, JobQueue, QueueError, SqliteJobQueue};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;

async fn test_queue() -> (SqliteJobQueue, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let db_path = dir.path().join("queue.db");
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

    let mut priorities = HashMap::new();
    for job_type in JobType::ALL {
        priorities.insert(job_type.as_str().to_string(), job_type.default_priority());
    }
    (SqliteJobQueue::new(pool, priorities), dir)
}

fn no_opts() -> EnqueueOptions {
    EnqueueOptions::default()
}

#[tokio::test]
async fn enqueue_assigns_type_weight_and_defaults() {
    let (queue, _dir) = test_queue().await;

    let outcome = queue
        .enqueue(JobType::Sync, json!({"peer_username": "crow"}), no_opts())
        .await
        .unwrap();
    assert!(!outcome.deduplicated);

    let job = queue.get_job(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.job_type, JobType::Sync);
    assert_eq!(job.priority, 100);
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert!(job.lease_until.is_none());
}

#[tokio::test]
async fn idempotent_enqueue_returns_existing_live_job() {
    let (queue, _dir) = test_queue().await;
    let opts = EnqueueOptions {
        idempotency_key: Some("artist_sync:spotify:abc".to_string()),
        ..Default::default()
    };

    let first = queue
        .enqueue(JobType::ArtistSync, json!({"artist_key": "spotify:abc"}), opts.clone())
        .await
        .unwrap();
    let second = queue
        .enqueue(JobType::ArtistSync, json!({"artist_key": "spotify:abc"}), opts.clone())
        .await
        .unwrap();

    assert_eq!(first.job_id, second.job_id);
    assert!(!first.deduplicated);
    assert!(second.deduplicated);

    // once terminal, the key is free again
    let leased = queue
        .lease(&[JobType::ArtistSync], Utc::now(), Duration::seconds(60), 1)
        .await
        .unwrap();
    queue
        .commit(leased[0].job.id, leased[0].lease_token)
        .await
        .unwrap();

    let third = queue
        .enqueue(JobType::ArtistSync, json!({"artist_key": "spotify:abc"}), opts)
        .await
        .unwrap();
    assert_ne!(third.job_id, first.job_id);
    assert!(!third.deduplicated);
}

#[tokio::test]
async fn lease_orders_by_weight_then_availability_then_id() {
    let (queue, _dir) = test_queue().await;
    let now = Utc::now();
    let at = EnqueueOptions {
        available_at: Some(now - Duration::seconds(5)),
        ..Default::default()
    };

    queue
        .enqueue(JobType::Watchlist, json!({"artist_key": "spotify:a"}), at.clone())
        .await
        .unwrap();
    let sync = queue
        .enqueue(JobType::Sync, json!({"peer_username": "crow"}), at.clone())
        .await
        .unwrap();
    let matching = queue
        .enqueue(JobType::Matching, json!({"ingest_item_id": "x"}), at)
        .await
        .unwrap();

    // three single-slot leases drain in weighted order
    let first = queue
        .lease(&JobType::ALL, now, Duration::seconds(60), 1)
        .await
        .unwrap();
    let second = queue
        .lease(&JobType::ALL, now, Duration::seconds(60), 1)
        .await
        .unwrap();
    let third = queue
        .lease(&JobType::ALL, now, Duration::seconds(60), 1)
        .await
        .unwrap();

    assert_eq!(first[0].job.id, sync.job_id);
    assert_eq!(second[0].job.id, matching.job_id);
    assert_eq!(third[0].job.job_type, JobType::Watchlist);
}

#[tokio::test]
async fn lease_tie_break_is_available_at_then_id() {
    let (queue, _dir) = test_queue().await;
    let now = Utc::now();

    let later = queue
        .enqueue(
            JobType::Matching,
            json!({"n": 1}),
            EnqueueOptions {
                available_at: Some(now - Duration::seconds(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let earlier = queue
        .enqueue(
            JobType::Matching,
            json!({"n": 2}),
            EnqueueOptions {
                available_at: Some(now - Duration::seconds(10)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let same_instant = queue
        .enqueue(
            JobType::Matching,
            json!({"n": 3}),
            EnqueueOptions {
                available_at: Some(now - Duration::seconds(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let leased = queue
        .lease(&[JobType::Matching], now, Duration::seconds(60), 10)
        .await
        .unwrap();
    let order: Vec<JobId> = leased.iter().map(|l| l.job.id).collect();
    assert_eq!(order, vec![earlier.job_id, later.job_id, same_instant.job_id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_leasers_never_share_a_job() {
    let (queue, _dir) = test_queue().await;
    let queue = Arc::new(queue);

    for i in 0..24 {
        queue
            .enqueue(JobType::Matching, json!({"n": i}), no_opts())
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let leased = queue
                    .lease(&[JobType::Matching], Utc::now(), Duration::seconds(60), 3)
                    .await
                    .unwrap();
                if leased.is_empty() {
                    break;
                }
                mine.extend(leased.into_iter().map(|l| l.job.id));
            }
            mine
        }));
    }

    let mut seen: HashSet<JobId> = HashSet::new();
    let mut total = 0usize;
    for handle in handles {
        for id in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "job {id} leased twice");
        }
    }
    assert_eq!(total, 24);
}

#[tokio::test]
async fn reap_restores_expired_lease_without_touching_attempts() {
    let (queue, _dir) = test_queue().await;
    let now = Utc::now();

    let outcome = queue
        .enqueue(JobType::Sync, json!({"peer_username": "crow"}), no_opts())
        .await
        .unwrap();

    let leased = queue
        .lease(&[JobType::Sync], now, Duration::seconds(30), 1)
        .await
        .unwrap();
    let token = leased[0].lease_token;
    assert_eq!(leased[0].job.attempts, 1);

    // nothing to reap while the lease is live
    let reaped = queue.reap(now + Duration::seconds(10)).await.unwrap();
    assert!(reaped.is_empty());

    // worker crashed; lease expires
    let reaped = queue.reap(now + Duration::seconds(31)).await.unwrap();
    assert_eq!(reaped, vec![outcome.job_id]);

    let job = queue.get_job(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);

    // the dead worker's token is useless now
    let err = queue
        .heartbeat(outcome.job_id, token, Utc::now() + Duration::seconds(60))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost(_)));

    // a new lease succeeds and counts the attempt
    let leased = queue
        .lease(&[JobType::Sync], Utc::now(), Duration::seconds(30), 1)
        .await
        .unwrap();
    assert_eq!(leased[0].job.attempts, 2);
}

#[tokio::test]
async fn retry_then_success_advances_available_at() {
    let (queue, _dir) = test_queue().await;
    let t0 = Utc::now();

    let outcome = queue
        .enqueue(JobType::Matching, json!({"track_id": "t1"}), no_opts())
        .await
        .unwrap();

    // attempt 1: retryable failure, backoff ~1s
    let leased = queue
        .lease(&[JobType::Matching], t0, Duration::seconds(60), 1)
        .await
        .unwrap();
    let fail = queue
        .fail(
            outcome.job_id,
            leased[0].lease_token,
            "peer timeout",
            true,
            3,
            t0 + Duration::seconds(1),
        )
        .await
        .unwrap();
    assert!(matches!(fail, FailOutcome::Retried { .. }));

    let job = queue.get_job(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.last_error.as_deref(), Some("peer timeout"));
    assert!(job.available_at >= t0 + Duration::seconds(1));

    // not leasable before the backoff elapses
    let leased = queue
        .lease(&[JobType::Matching], t0, Duration::seconds(60), 1)
        .await
        .unwrap();
    assert!(leased.is_empty());

    // attempt 2: retryable failure, backoff ~2s
    let leased = queue
        .lease(
            &[JobType::Matching],
            t0 + Duration::seconds(1),
            Duration::seconds(60),
            1,
        )
        .await
        .unwrap();
    queue
        .fail(
            outcome.job_id,
            leased[0].lease_token,
            "peer timeout",
            true,
            3,
            t0 + Duration::seconds(3),
        )
        .await
        .unwrap();

    // attempt 3: success
    let leased = queue
        .lease(
            &[JobType::Matching],
            t0 + Duration::seconds(3),
            Duration::seconds(60),
            1,
        )
        .await
        .unwrap();
    queue
        .commit(outcome.job_id, leased[0].lease_token)
        .await
        .unwrap();

    let job = queue.get_job(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempts, 3);
}

#[tokio::test]
async fn exhausted_retries_dead_letter_with_last_error() {
    let (queue, _dir) = test_queue().await;
    let t0 = Utc::now();

    let outcome = queue
        .enqueue(JobType::ArtistSync, json!({"artist_key": "spotify:abc"}), no_opts())
        .await
        .unwrap();

    let leased = queue
        .lease(&[JobType::ArtistSync], t0, Duration::seconds(60), 1)
        .await
        .unwrap();
    let fail = queue
        .fail(
            outcome.job_id,
            leased[0].lease_token,
            "first failure",
            true,
            2,
            t0 + Duration::seconds(1),
        )
        .await
        .unwrap();
    assert!(matches!(fail, FailOutcome::Retried { .. }));

    // attempt 2 of max 2: dead-lettered, no third attempt possible
    let leased = queue
        .lease(
            &[JobType::ArtistSync],
            t0 + Duration::seconds(1),
            Duration::seconds(60),
            1,
        )
        .await
        .unwrap();
    let fail = queue
        .fail(
            outcome.job_id,
            leased[0].lease_token,
            "second failure",
            true,
            2,
            t0 + Duration::seconds(3),
        )
        .await
        .unwrap();
    assert_eq!(fail, FailOutcome::Dead);

    let job = queue.get_job(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Dead);

    let dead = queue.list_dead_letters(10, 0).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_id, outcome.job_id);
    assert_eq!(dead[0].reason, "second failure");
    assert_eq!(dead[0].attempts, 2);

    let leased = queue
        .lease(
            &[JobType::ArtistSync],
            t0 + Duration::seconds(30),
            Duration::seconds(60),
            1,
        )
        .await
        .unwrap();
    assert!(leased.is_empty());
}

#[tokio::test]
async fn permanent_failure_skips_retries() {
    let (queue, _dir) = test_queue().await;

    let outcome = queue
        .enqueue(JobType::Matching, json!({"track_id": "t1"}), no_opts())
        .await
        .unwrap();
    let leased = queue
        .lease(&[JobType::Matching], Utc::now(), Duration::seconds(60), 1)
        .await
        .unwrap();

    let fail = queue
        .fail(
            outcome.job_id,
            leased[0].lease_token,
            "schema violation in provider payload",
            false,
            5,
            Utc::now() + Duration::seconds(1),
        )
        .await
        .unwrap();
    assert_eq!(fail, FailOutcome::Dead);
}

#[tokio::test]
async fn commit_after_lease_expiry_is_lease_lost() {
    let (queue, _dir) = test_queue().await;

    let outcome = queue
        .enqueue(JobType::Sync, json!({"peer_username": "crow"}), no_opts())
        .await
        .unwrap();
    let leased = queue
        .lease(&[JobType::Sync], Utc::now(), Duration::milliseconds(20), 1)
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let err = queue
        .commit(outcome.job_id, leased[0].lease_token)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost(_)));
}

#[tokio::test]
async fn heartbeat_extends_the_lease() {
    let (queue, _dir) = test_queue().await;

    let outcome = queue
        .enqueue(JobType::Sync, json!({"peer_username": "crow"}), no_opts())
        .await
        .unwrap();
    let leased = queue
        .lease(&[JobType::Sync], Utc::now(), Duration::milliseconds(50), 1)
        .await
        .unwrap();

    queue
        .heartbeat(
            outcome.job_id,
            leased[0].lease_token,
            Utc::now() + Duration::seconds(60),
        )
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(80)).await;

    // original lease window has passed, but the heartbeat kept it alive
    queue
        .commit(outcome.job_id, leased[0].lease_token)
        .await
        .unwrap();
}

#[tokio::test]
async fn dead_letters_requeue_and_purge() {
    let (queue, _dir) = test_queue().await;
    let t0 = Utc::now();

    for i in 0..3 {
        let outcome = queue
            .enqueue(JobType::Matching, json!({"n": i}), no_opts())
            .await
            .unwrap();
        let leased = queue
            .lease(&[JobType::Matching], t0, Duration::seconds(60), 1)
            .await
            .unwrap();
        queue
            .fail(outcome.job_id, leased[0].lease_token, "boom", false, 1, t0)
            .await
            .unwrap();
    }
    assert_eq!(queue.list_dead_letters(10, 0).await.unwrap().len(), 3);

    let requeued = queue.requeue_dead_letters(2).await.unwrap();
    assert_eq!(requeued, 2);
    assert_eq!(queue.list_dead_letters(10, 0).await.unwrap().len(), 1);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.dead, 1);

    // requeued jobs start over
    let leased = queue
        .lease(&[JobType::Matching], Utc::now(), Duration::seconds(60), 10)
        .await
        .unwrap();
    assert_eq!(leased.len(), 2);
    assert_eq!(leased[0].job.attempts, 1);

    let purged = queue.purge_dead_letters(10).await.unwrap();
    assert_eq!(purged, 1);
    assert!(queue.list_dead_letters(10, 0).await.unwrap().is_empty());
    assert_eq!(queue.stats().await.unwrap().dead, 0);
}

#[tokio::test]
async fn pending_count_narrows_by_type() {
    let (queue, _dir) = test_queue().await;

    queue
        .enqueue(JobType::Matching, json!({"n": 1}), no_opts())
        .await
        .unwrap();
    queue
        .enqueue(JobType::Matching, json!({"n": 2}), no_opts())
        .await
        .unwrap();
    queue
        .enqueue(JobType::Sync, json!({"peer_username": "crow"}), no_opts())
        .await
        .unwrap();

    assert_eq!(queue.pending_count(None).await.unwrap(), 3);
    assert_eq!(
        queue.pending_count(Some(JobType::Matching)).await.unwrap(),
        2
    );
    assert_eq!(queue.pending_count(Some(JobType::Retry)).await.unwrap(), 0);
}

#[tokio::test]
async fn cleanup_succeeded_respects_cutoff() {
    let (queue, _dir) = test_queue().await;

    let outcome = queue
        .enqueue(JobType::Sync, json!({"peer_username": "crow"}), no_opts())
        .await
        .unwrap();
    let leased = queue
        .lease(&[JobType::Sync], Utc::now(), Duration::seconds(60), 1)
        .await
        .unwrap();
    queue
        .commit(outcome.job_id, leased[0].lease_token)
        .await
        .unwrap();

    // cutoff in the past removes nothing
    let removed = queue
        .cleanup_succeeded(Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(removed, 0);

    let removed = queue
        .cleanup_succeeded(Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(queue.get_job(outcome.job_id).await.unwrap().is_none());
}
