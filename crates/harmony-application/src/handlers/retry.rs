// SPDX-License-Identifier: GPL-3.0-or-later

//! Retry reaper: scan failed downloads whose backoff has elapsed and hand
//! them back to fresh sync jobs.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use harmony_config::RetryConfig;
use harmony_domain::{DownloadFile, IngestItemId, JobType};
use harmony_queue::{EnqueueOptions, JobQueue};
use serde_json::json;
use tracing::info;

use crate::handlers::{HandlerOutcome, JobContext, JobHandler};
use crate::repositories::{DownloadRepository, IngestRepository};

pub struct RetryScanHandler {
    downloads: Arc<dyn DownloadRepository>,
    ingest: Arc<dyn IngestRepository>,
    queue: Arc<dyn JobQueue>,
    config: RetryConfig,
}

impl RetryScanHandler {
    pub fn new(
        downloads: Arc<dyn DownloadRepository>,
        ingest: Arc<dyn IngestRepository>,
        queue: Arc<dyn JobQueue>,
        config: RetryConfig,
    ) -> Self {
        Self {
            downloads,
            ingest,
            queue,
            config,
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for RetryScanHandler {
    fn job_type(&self) -> JobType {
        JobType::Retry
    }

    async fn execute(&self, ctx: JobContext) -> Result<HandlerOutcome> {
        let now = Utc::now();
        let due = self
            .downloads
            .list_retryable(now, self.config.max_attempts, self.config.scan_batch_limit as i64)
            .await?;

        if due.is_empty() {
            return Ok(HandlerOutcome::skipped());
        }

        // one sync job per (peer, ingest item) so a completed transfer can
        // still finish its item; unlinked files share the peer's job
        let mut groups: BTreeMap<(String, Option<IngestItemId>), Vec<DownloadFile>> =
            BTreeMap::new();
        for file in due {
            let item_id = match file.job_id {
                Some(failed_job) => self
                    .ingest
                    .find_item_by_download_job(failed_job)
                    .await?
                    .map(|item| item.id),
                None => None,
            };
            groups
                .entry((file.peer_username.clone(), item_id))
                .or_default()
                .push(file);
        }

        let mut enqueued = 0usize;
        let mut files_requeued = 0usize;
        for ((peer_username, item_id), files) in groups {
            let specs: Vec<serde_json::Value> = files
                .iter()
                .map(|file| {
                    json!({
                        "filename": file.filename,
                        "size_bytes": file.size_bytes,
                        "priority": file.priority,
                    })
                })
                .collect();
            let ids: Vec<serde_json::Value> =
                files.iter().map(|file| json!(file.id)).collect();

            let mut payload = json!({
                "peer_username": peer_username,
                "files": specs,
                "download_file_ids": ids,
            });
            if let Some(item_id) = item_id {
                payload["ingest_item_id"] = json!(item_id);
            }

            let outcome = self
                .queue
                .enqueue(JobType::Sync, payload, EnqueueOptions::default())
                .await?;

            for file in &files {
                self.downloads.mark_requeued(file.id, outcome.job_id).await?;
                files_requeued += 1;
            }
            // keep the item pointed at the job currently carrying it
            if let Some(item_id) = item_id {
                self.ingest.set_download_job(item_id, outcome.job_id).await?;
            }
            enqueued += 1;
        }

        info!(
            target: "handlers",
            event = "worker.job",
            job_id = %ctx.job_id,
            jobs_enqueued = enqueued,
            files_requeued,
            status = "ok",
        );
        Ok(HandlerOutcome::success())
    }
}
