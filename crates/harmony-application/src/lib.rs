// SPDX-License-Identifier: GPL-3.0-or-later
use harmony_config::AppConfig;
pub mod delta;
pub mod events;
pub mod handlers;
pub mod ingest;
pub mod locks;
pub mod matching;
pub mod repositories;
pub mod retry_policy;
pub mod sqlite_adapters;
pub mod text;

use std::sync::Arc;

use harmony_cache::ResponseCache;
use harmony_providers::ProviderGateway;
use harmony_queue::{JobQueue, SqliteJobQueue};
use sqlx::SqlitePool;
use tracing::info;

pub use delta::{diff, ArtistDelta, AuditDraft, DeltaPolicy, ReleaseOp};
pub use events::{EventPublisher, InMemoryEventBus, TracingEventBus};
pub use handlers::{
    ArtistSyncHandler, HandlerOutcome, HandlerRegistry, JobContext, JobHandler, MatchingHandler,
    PlaylistExpandHandler, RetryScanHandler, SyncHandler, WatchlistHandler,
};
pub use ingest::{
    parse_playlist_link, parse_track_line, IngestError, IngestOutcome, IngestService,
    IngestSubmission, IngestUpload,
};
pub use locks::{ArtistLockGuard, ArtistLockRegistry};
pub use matching::{MatchDecision, MatchEngine, MatchOutcome, ScoredCandidate};
pub use repositories::{
    DownloadRepository, IngestRepository, LibraryRepository, WatchlistRepository,
};
pub use retry_policy::RetryPolicyProvider;
pub use sqlite_adapters::{
    SqliteDownloadRepository, SqliteIngestRepository, SqliteLibraryRepository,
    SqliteWatchlistRepository,
};

/// Shared application state wired once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub queue: Arc<dyn JobQueue>,
    pub cache: Arc<ResponseCache>,
    pub gateway: Arc<ProviderGateway>,
    pub watchlist: Arc<dyn WatchlistRepository>,
    pub library: Arc<dyn LibraryRepository>,
    pub ingest_repo: Arc<dyn IngestRepository>,
    pub downloads: Arc<dyn DownloadRepository>,
    pub ingest: Arc<IngestService>,
    pub retry_policies: Arc<RetryPolicyProvider>,
    pub locks: ArtistLockRegistry,
}

impl AppState {
    /// Wire repositories and services over an initialized pool.
    pub fn new(config: AppConfig, pool: SqlitePool) -> anyhow::Result<Self> {
        let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(
            pool.clone(),
            config.orchestrator.priority_map(),
        ));
        let cache = Arc::new(ResponseCache::new(&config.cache));
        let gateway = Arc::new(ProviderGateway::from_config(&config.providers)?);
        let watchlist: Arc<dyn WatchlistRepository> =
            Arc::new(SqliteWatchlistRepository::new(pool.clone()));
        let library: Arc<dyn LibraryRepository> =
            Arc::new(SqliteLibraryRepository::new(pool.clone()));
        let ingest_repo: Arc<dyn IngestRepository> =
            Arc::new(SqliteIngestRepository::new(pool.clone()));
        let downloads: Arc<dyn DownloadRepository> =
            Arc::new(SqliteDownloadRepository::new(pool));
        let ingest = Arc::new(IngestService::new(
            ingest_repo.clone(),
            queue.clone(),
            config.ingest.clone(),
        ));
        let retry_policies = Arc::new(RetryPolicyProvider::new(config.retry.clone()));

        Ok(Self {
            config,
            queue,
            cache,
            gateway,
            watchlist,
            library,
            ingest_repo,
            downloads,
            ingest,
            retry_policies,
            locks: ArtistLockRegistry::new(),
        })
    }

    /// Build the handler registry for every job type this build ships.
    pub fn handler_registry(&self) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(WatchlistHandler::new(
            self.watchlist.clone(),
            self.queue.clone(),
            self.config.watchlist.clone(),
        )));
        registry.register(Arc::new(ArtistSyncHandler::new(
            self.library.clone(),
            self.watchlist.clone(),
            self.locks.clone(),
            self.gateway.clone(),
            self.cache.clone(),
            self.config.reconcile.clone(),
        )));
        registry.register(Arc::new(MatchingHandler::new(
            self.ingest_repo.clone(),
            self.downloads.clone(),
            self.queue.clone(),
            self.gateway.clone(),
            &self.config.matching,
        )));
        registry.register(Arc::new(SyncHandler::new(
            self.downloads.clone(),
            self.ingest_repo.clone(),
            self.gateway.clone(),
            self.retry_policies.clone(),
            self.config.sync.clone(),
        )));
        registry.register(Arc::new(RetryScanHandler::new(
            self.downloads.clone(),
            self.ingest_repo.clone(),
            self.queue.clone(),
            self.config.retry.clone(),
        )));
        registry.register(Arc::new(PlaylistExpandHandler::new(
            self.ingest_repo.clone(),
            self.queue.clone(),
            self.gateway.clone(),
            self.config.ingest.clone(),
        )));

        info!(target: "application", handlers = registry.len(), "handler registry built");
        registry
    }

    pub fn on_start(&self) {
        info!(target: "application", "application state initialized");
    }
}
