// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://harmony.db".to_string(),
            pool_max_size: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5160,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Scheduler/dispatcher tuning. Pool sizes and the priority map are keyed
/// by job type name so operators can tune types this build does not know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub poll_interval_ms: u64,
    pub poll_interval_max_ms: u64,
    pub visibility_timeout_s: u64,
    pub global_concurrency: usize,
    /// Heartbeat cadence override; when unset the dispatcher beats at half
    /// the lease duration.
    pub heartbeat_s: Option<u64>,
    pub pools: HashMap<String, usize>,
    /// JSON map `{"sync":100,...}`; takes precedence over `priority_csv`.
    pub priority_json: Option<String>,
    /// CSV `sync:100,matching:90` fallback.
    pub priority_csv: Option<String>,
    pub reap_interval_s: u64,
    /// Bounded retention: succeeded jobs older than this are deleted.
    pub succeeded_retention_s: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut pools = HashMap::new();
        pools.insert("sync".to_string(), 4);
        pools.insert("artist_sync".to_string(), 4);
        pools.insert("matching".to_string(), 4);
        pools.insert("retry".to_string(), 2);
        pools.insert("watchlist".to_string(), 2);
        pools.insert("playlist_expand".to_string(), 2);
        Self {
            poll_interval_ms: 250,
            poll_interval_max_ms: 5_000,
            visibility_timeout_s: 60,
            global_concurrency: 8,
            heartbeat_s: None,
            pools,
            priority_json: None,
            priority_csv: None,
            reap_interval_s: 30,
            succeeded_retention_s: 7 * 24 * 60 * 60,
        }
    }
}

impl OrchestratorConfig {
    /// Effective poll floor; values below 10 ms are clamped up.
    pub fn poll_floor_ms(&self) -> u64 {
        self.poll_interval_ms.max(10)
    }

    /// Resolve the weighted priority map. JSON overrides win over CSV
    /// entries; unknown types in either source are kept so the queue can
    /// order jobs enqueued by newer builds.
    pub fn priority_map(&self) -> HashMap<String, i64> {
        let mut map = HashMap::new();

        if let Some(csv) = self.priority_csv.as_deref() {
            for pair in csv.split(',') {
                let pair = pair.trim();
                if pair.is_empty() {
                    continue;
                }
                match pair.split_once(':') {
                    Some((job_type, weight)) => match weight.trim().parse::<i64>() {
                        Ok(weight) => {
                            map.insert(job_type.trim().to_string(), weight);
                        }
                        Err(_) => {
                            warn!(target: "config", pair, "ignoring unparsable priority weight");
                        }
                    },
                    None => {
                        warn!(target: "config", pair, "ignoring malformed priority pair");
                    }
                }
            }
        }

        if let Some(json) = self.priority_json.as_deref() {
            match serde_json::from_str::<HashMap<String, i64>>(json) {
                Ok(parsed) => map.extend(parsed),
                Err(error) => {
                    warn!(target: "config", %error, "ignoring unparsable priority JSON");
                }
            }
        }

        map
    }

    pub fn pool_size(&self, job_type: &str) -> usize {
        self.pools.get(job_type).copied().unwrap_or(2).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistConfig {
    pub timer_interval_s: u64,
    pub max_per_tick: u32,
    pub shutdown_grace_ms: u64,
    pub artist_cooldown_s: u64,
    /// Per-artist retry budget reset value after cooldown.
    pub retry_budget: i64,
}

impl Default for WatchlistConfig {
    fn default() -> Self {
        Self {
            timer_interval_s: 900,
            max_per_tick: 50,
            shutdown_grace_ms: 5_000,
            artist_cooldown_s: 6 * 60 * 60,
            retry_budget: 5,
        }
    }
}

/// Per-type override; unset fields inherit from the global policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryOverride {
    pub max_attempts: Option<u32>,
    pub base_seconds: Option<f64>,
    pub jitter_pct: Option<f64>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_seconds: f64,
    pub jitter_pct: f64,
    pub timeout_seconds: Option<u64>,
    /// Seconds before the policy snapshot is reloaded.
    pub policy_reload_s: u64,
    pub scan_batch_limit: u32,
    pub overrides: HashMap<String, RetryOverride>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_seconds: 2.0,
            jitter_pct: 0.2,
            timeout_seconds: None,
            policy_reload_s: 10,
            scan_batch_limit: 100,
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_items: usize,
    pub default_ttl_s: u64,
    pub default_swr_s: u64,
    /// When true the cache emits `cache.evict` events on invalidation.
    pub log_evictions: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_items: 1_024,
            default_ttl_s: 60,
            default_swr_s: 300,
            log_evictions: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpointConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub retry_max: u32,
    pub backoff_base_ms: u64,
    pub jitter_pct: f64,
    pub api_key: Option<String>,
}

impl Default for ProviderEndpointConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_ms: 10_000,
            retry_max: 3,
            backoff_base_ms: 250,
            jitter_pct: 0.2,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealthConfig {
    pub interval_s: u64,
    /// Providers whose failed probe forces `overall=down`. Empty means all
    /// providers are critical.
    pub critical: Vec<String>,
}

impl Default for ProviderHealthConfig {
    fn default() -> Self {
        Self {
            interval_s: 30,
            critical: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub max_concurrency: usize,
    pub metadata: ProviderEndpointConfig,
    pub peer: ProviderEndpointConfig,
    pub health: ProviderHealthConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            metadata: ProviderEndpointConfig {
                base_url: "http://127.0.0.1:8700".to_string(),
                ..ProviderEndpointConfig::default()
            },
            peer: ProviderEndpointConfig {
                base_url: "http://127.0.0.1:5030".to_string(),
                timeout_ms: 20_000,
                ..ProviderEndpointConfig::default()
            },
            health: ProviderHealthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub batch_size: u32,
    pub max_pending_jobs: u32,
    pub free_max_tracks_per_request: u32,
    pub free_import_max_lines: u32,
    pub free_import_max_file_bytes: u64,
    pub free_import_max_playlist_links: u32,
    /// Absolute fuse: no request may produce more than
    /// `free_max_tracks_per_request * hard_cap_multiplier` items.
    pub free_import_hard_cap_multiplier: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_pending_jobs: 500,
            free_max_tracks_per_request: 200,
            free_import_max_lines: 200,
            free_import_max_file_bytes: 1024 * 1024,
            free_import_max_playlist_links: 3,
            free_import_hard_cap_multiplier: 10,
        }
    }
}

impl IngestConfig {
    pub fn hard_cap(&self) -> u32 {
        self.free_max_tracks_per_request
            .saturating_mul(self.free_import_hard_cap_multiplier)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub worker_concurrency: usize,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            poll_initial_ms: 500,
            poll_max_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub confidence_threshold: f64,
    /// Format ranking, best first.
    pub preferred_formats: Vec<String>,
    pub max_candidates: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.65,
            preferred_formats: vec!["flac".to_string(), "mp3".to_string()],
            max_candidates: 50,
        }
    }
}

/// Reconciliation policy for artist synchronization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Soft-delete releases no longer reported by the provider.
    pub prune: bool,
    /// Hard-delete instead of soft-deleting. Off by default.
    pub hard_delete: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            prune: true,
            hard_delete: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    pub requeue_limit: u32,
    pub purge_limit: u32,
    pub page_size_default: u32,
    pub page_size_max: u32,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            requeue_limit: 100,
            purge_limit: 500,
            page_size_default: 25,
            page_size_max: 200,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub telemetry: TelemetryConfig,
    pub orchestrator: OrchestratorConfig,
    pub watchlist: WatchlistConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub providers: ProvidersConfig,
    pub ingest: IngestConfig,
    pub sync: SyncConfig,
    pub matching: MatchingConfig,
    pub reconcile: ReconcileConfig,
    pub dlq: DlqConfig,
}

/// Load configuration from defaults, optional TOML file, and environment overrides (prefix: HARMONY_).
pub fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("HARMONY_").split("__"));

    let config: AppConfig = figment.extract()?;
    info!(target: "config", "configuration loaded");
    Ok(config)
}
