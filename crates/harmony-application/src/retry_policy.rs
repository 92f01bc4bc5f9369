// SPDX-License-Identifier: GPL-3.0-or-later

//! Cached resolution of per-job-type retry parameters.
//!
//! The provider keeps one immutable snapshot of `{job_type → RetryPolicy}`
//! and swaps it wholesale when it ages past the reload TTL, so readers
//! always see a consistent map. Overrides merge field-wise onto the
//! global defaults.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use harmony_config::RetryConfig;
use harmony_domain::{JobType, RetryPolicy};
use rand::Rng;
use std::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

struct Snapshot {
    policies: HashMap<String, RetryPolicy>,
    loaded_at: Instant,
}

pub struct RetryPolicyProvider {
    config: RetryConfig,
    snapshot: RwLock<Arc<Snapshot>>,
    force_reload: std::sync::atomic::AtomicBool,
}

impl RetryPolicyProvider {
    pub fn new(config: RetryConfig) -> Self {
        let snapshot = Arc::new(build_snapshot(&config));
        Self {
            config,
            snapshot: RwLock::new(snapshot),
            force_reload: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Resolve the policy for a job type, reloading the snapshot when it
    /// is older than the configured TTL.
    pub fn get(&self, job_type: JobType) -> RetryPolicy {
        use std::sync::atomic::Ordering;

        let ttl = std::time::Duration::from_secs(self.config.policy_reload_s);
        let current = self
            .snapshot
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        let expired =
            self.force_reload.swap(false, Ordering::SeqCst) || current.loaded_at.elapsed() > ttl;
        let snapshot = if expired {
            let rebuilt = Arc::new(build_snapshot(&self.config));
            let mut guard = self.snapshot.write().unwrap_or_else(|p| p.into_inner());
            *guard = rebuilt.clone();
            debug!(target: "retry", "retry policy snapshot reloaded");
            rebuilt
        } else {
            current
        };

        snapshot
            .policies
            .get(job_type.as_str())
            .copied()
            .unwrap_or_else(|| global_policy(&self.config))
    }

    /// Mark the snapshot stale; the next `get` rebuilds it.
    pub fn invalidate(&self) {
        self.force_reload
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Sample the next retry time for a failed attempt.
    pub fn next_retry_at(
        &self,
        job_type: JobType,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let policy = self.get(job_type);
        let jitter_unit: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let delay = policy.backoff_seconds(attempt, jitter_unit);
        now + ChronoDuration::milliseconds((delay * 1_000.0) as i64)
    }
}

fn global_policy(config: &RetryConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: config.max_attempts,
        base_seconds: config.base_seconds,
        jitter_pct: config.jitter_pct,
        timeout_seconds: config.timeout_seconds,
    }
}

fn build_snapshot(config: &RetryConfig) -> Snapshot {
    let global = global_policy(config);
    let mut policies = HashMap::new();

    for job_type in JobType::ALL {
        policies.insert(job_type.as_str().to_string(), global);
    }
    for (job_type, over) in &config.overrides {
        let base = policies.get(job_type.as_str()).copied().unwrap_or(global);
        policies.insert(
            job_type.clone(),
            RetryPolicy {
                max_attempts: over.max_attempts.unwrap_or(base.max_attempts),
                base_seconds: over.base_seconds.unwrap_or(base.base_seconds),
                jitter_pct: over.jitter_pct.unwrap_or(base.jitter_pct),
                timeout_seconds: over.timeout_seconds.or(base.timeout_seconds),
            },
        );
    }

    Snapshot {
        policies,
        loaded_at: Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harmony_config::RetryOverride;

    fn config_with_override() -> RetryConfig {
        let mut config = RetryConfig::default();
        config.max_attempts = 3;
        config.base_seconds = 2.0;
        config.overrides.insert(
            "sync".to_string(),
            RetryOverride {
                max_attempts: Some(6),
                base_seconds: None,
                jitter_pct: Some(0.0),
                timeout_seconds: Some(120),
            },
        );
        config
    }

    #[test]
    fn overrides_merge_onto_globals() {
        let provider = RetryPolicyProvider::new(config_with_override());

        let sync = provider.get(JobType::Sync);
        assert_eq!(sync.max_attempts, 6);
        assert_eq!(sync.base_seconds, 2.0);
        assert_eq!(sync.jitter_pct, 0.0);
        assert_eq!(sync.timeout_seconds, Some(120));

        let matching = provider.get(JobType::Matching);
        assert_eq!(matching.max_attempts, 3);
        assert_eq!(matching.timeout_seconds, None);
    }

    #[test]
    fn invalidate_forces_rebuild() {
        let provider = RetryPolicyProvider::new(config_with_override());
        assert_eq!(provider.get(JobType::Sync).max_attempts, 6);
        provider.invalidate();
        // the stale empty snapshot is replaced on the next lookup
        assert_eq!(provider.get(JobType::Sync).max_attempts, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reloads_after_ttl() {
        let mut config = config_with_override();
        config.policy_reload_s = 10;
        let provider = RetryPolicyProvider::new(config);

        let first = provider.get(JobType::Sync);
        tokio::time::advance(std::time::Duration::from_secs(11)).await;
        let second = provider.get(JobType::Sync);
        assert_eq!(first, second);
    }

    #[test]
    fn next_retry_advances_within_bounds() {
        let mut config = RetryConfig::default();
        config.base_seconds = 1.0;
        config.jitter_pct = 0.0;
        let provider = RetryPolicyProvider::new(config);

        let now = Utc::now();
        let first = provider.next_retry_at(JobType::Matching, 1, now);
        let second = provider.next_retry_at(JobType::Matching, 2, now);
        assert_eq!((first - now).num_seconds(), 1);
        assert_eq!((second - now).num_seconds(), 2);
    }
}
