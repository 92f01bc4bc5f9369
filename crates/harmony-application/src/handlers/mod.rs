// SPDX-License-Identifier: GPL-3.0-or-later

//! Typed job handlers and their registry.
//!
//! Handlers are idempotent: the queue is at-least-once and a reaped lease
//! replays the job. Each handler classifies its own failures; the
//! dispatcher turns the outcome into a queue transition.

pub mod artist_sync;
pub mod matching;
pub mod playlist_expand;
pub mod retry;
pub mod sync;
pub mod watchlist;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use harmony_domain::{JobId, JobType};
use tokio_util::sync::CancellationToken;

pub use artist_sync::ArtistSyncHandler;
pub use matching::MatchingHandler;
pub use playlist_expand::PlaylistExpandHandler;
pub use retry::RetryScanHandler;
pub use sync::SyncHandler;
pub use watchlist::WatchlistHandler;

/// Classified handler result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success { skipped: bool },
    Retryable { error: String },
    Permanent { error: String },
}

impl HandlerOutcome {
    pub fn success() -> Self {
        Self::Success { skipped: false }
    }

    pub fn skipped() -> Self {
        Self::Success { skipped: true }
    }

    pub fn retryable(error: impl Into<String>) -> Self {
        Self::Retryable {
            error: error.into(),
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        Self::Permanent {
            error: error.into(),
        }
    }
}

/// Execution context handed to a handler by the dispatcher.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: JobType,
    pub attempt: u32,
    pub payload: serde_json::Value,
    /// Fired on shutdown or lease loss; long-running handlers select on it.
    pub cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(job_id: JobId, job_type: JobType, attempt: u32, payload: serde_json::Value) -> Self {
        Self {
            job_id,
            job_type,
            attempt,
            payload,
            cancellation: CancellationToken::new(),
        }
    }

    /// Typed view of the payload.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn execute(&self, ctx: JobContext) -> Result<HandlerOutcome>;
}

/// Registry mapping job types to handlers, populated at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.job_type(), handler);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    /// Types the scheduler should lease.
    pub fn registered_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler(JobType);

    #[async_trait::async_trait]
    impl JobHandler for NoopHandler {
        fn job_type(&self) -> JobType {
            self.0
        }

        async fn execute(&self, _ctx: JobContext) -> Result<HandlerOutcome> {
            Ok(HandlerOutcome::success())
        }
    }

    #[test]
    fn registry_resolves_by_type() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(NoopHandler(JobType::Watchlist)));
        registry.register(Arc::new(NoopHandler(JobType::Sync)));

        assert!(registry.get(JobType::Watchlist).is_some());
        assert!(registry.get(JobType::Matching).is_none());
        assert_eq!(registry.registered_types(), vec![JobType::Sync, JobType::Watchlist]);
    }

    #[test]
    fn payload_parsing() {
        let ctx = JobContext::new(
            JobId(1),
            JobType::Watchlist,
            1,
            serde_json::json!({"artist_key": "spotify:abc"}),
        );
        #[derive(serde::Deserialize)]
        struct Payload {
            artist_key: String,
        }
        let payload: Payload = ctx.parse_payload().unwrap();
        assert_eq!(payload.artist_key, "spotify:abc");
    }
}
