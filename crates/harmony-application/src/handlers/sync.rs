// SPDX-License-Identifier: GPL-3.0-or-later

//! Download job: push files to the peer daemon and poll each transfer to
//! completion.
//!
//! Files run in parallel up to the configured worker width. Polling backs
//! off adaptively from the initial interval to the cap. Partial success is
//! allowed: the job succeeds when at least one file lands; otherwise it is
//! retryable and failed files carry their retry metadata for the reaper.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use harmony_config::SyncConfig;
use harmony_domain::{
    DownloadFile, DownloadFileId, DownloadState, IngestItemId, IngestState, JobType,
};
use harmony_providers::{DownloadRequestFile, ProviderGateway};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::handlers::{HandlerOutcome, JobContext, JobHandler};
use crate::repositories::{DownloadRepository, IngestRepository};
use crate::retry_policy::RetryPolicyProvider;

#[derive(Debug, Clone, Deserialize)]
struct SyncFile {
    filename: String,
    #[serde(default)]
    size_bytes: Option<u64>,
    #[serde(default)]
    priority: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SyncPayload {
    peer_username: String,
    files: Vec<SyncFile>,
    /// Existing `download_files` rows, positionally matching `files`.
    #[serde(default)]
    download_file_ids: Vec<Uuid>,
    /// Ingest item this download serves; completed once a file lands.
    #[serde(default)]
    ingest_item_id: Option<Uuid>,
}

pub struct SyncHandler {
    downloads: Arc<dyn DownloadRepository>,
    ingest: Arc<dyn IngestRepository>,
    gateway: Arc<ProviderGateway>,
    retry_policies: Arc<RetryPolicyProvider>,
    config: SyncConfig,
}

impl SyncHandler {
    pub fn new(
        downloads: Arc<dyn DownloadRepository>,
        ingest: Arc<dyn IngestRepository>,
        gateway: Arc<ProviderGateway>,
        retry_policies: Arc<RetryPolicyProvider>,
        config: SyncConfig,
    ) -> Self {
        Self {
            downloads,
            ingest,
            gateway,
            retry_policies,
            config,
        }
    }

    /// A landed transfer completes its ingest item; when every sibling is
    /// terminal, the parent ingest job is too.
    async fn complete_ingest_item(&self, item_id: IngestItemId) -> Result<()> {
        let Some(item) = self.ingest.get_item(item_id).await? else {
            debug!(target: "handlers", %item_id, "ingest item gone, skipping completion");
            return Ok(());
        };
        // replay after a crash: the item already reached a terminal state
        if item.state != IngestState::Queued {
            return Ok(());
        }
        self.ingest
            .advance_item(item_id, IngestState::Completed, None, None)
            .await?;

        let Some(mut job) = self.ingest.get_job(item.ingest_job_id).await? else {
            return Ok(());
        };
        let counts = self.ingest.item_state_counts(job.id).await?;
        job.counts.completed = counts.get(&IngestState::Completed).copied().unwrap_or(0) as u32;
        job.counts.failed = counts.get(&IngestState::Failed).copied().unwrap_or(0) as u32;
        let open: i64 = counts
            .iter()
            .filter(|(state, _)| !matches!(state, IngestState::Completed | IngestState::Failed))
            .map(|(_, n)| *n)
            .sum();
        if open == 0 && job.state.can_advance_to(IngestState::Completed) {
            job.state = IngestState::Completed;
        }
        self.ingest.update_job(&job).await?;
        Ok(())
    }

    /// Resolve or create the `download_files` rows for this job.
    async fn resolve_files(
        &self,
        ctx: &JobContext,
        payload: &SyncPayload,
    ) -> Result<Vec<DownloadFile>> {
        let mut files = Vec::with_capacity(payload.files.len());
        for (index, spec) in payload.files.iter().enumerate() {
            let existing = match payload.download_file_ids.get(index) {
                Some(raw_id) => self.downloads.get(DownloadFileId::from_uuid(*raw_id)).await?,
                None => None,
            };
            let file = match existing {
                Some(file) => file,
                None => {
                    let mut file = DownloadFile::new(&payload.peer_username, &spec.filename);
                    file.size_bytes = spec.size_bytes;
                    file.priority = spec.priority;
                    file.job_id = Some(ctx.job_id);
                    self.downloads.insert_files(std::slice::from_ref(&file)).await?;
                    file
                }
            };
            files.push(file);
        }
        Ok(files)
    }
}

#[async_trait::async_trait]
impl JobHandler for SyncHandler {
    fn job_type(&self) -> JobType {
        JobType::Sync
    }

    async fn execute(&self, ctx: JobContext) -> Result<HandlerOutcome> {
        let payload: SyncPayload = match ctx.parse_payload() {
            Ok(payload) => payload,
            Err(error) => return Ok(HandlerOutcome::permanent(format!("bad payload: {error}"))),
        };
        if payload.files.is_empty() {
            return Ok(HandlerOutcome::permanent("no files to download"));
        }

        let files = self.resolve_files(&ctx, &payload).await?;
        let workers = Arc::new(Semaphore::new(self.config.worker_concurrency.max(1)));
        let mut tasks: JoinSet<bool> = JoinSet::new();

        for file in files {
            // already landed in a previous attempt; idempotent replay
            if file.state == DownloadState::Completed {
                continue;
            }

            let workers = workers.clone();
            let downloads = self.downloads.clone();
            let gateway = self.gateway.clone();
            let retry_policies = self.retry_policies.clone();
            let username = payload.peer_username.clone();
            let cancellation = ctx.cancellation.clone();
            let poll_initial_ms = self.config.poll_initial_ms.max(10);
            let poll_max_ms = self.config.poll_max_ms.max(poll_initial_ms);

            tasks.spawn(async move {
                let _permit = workers.acquire_owned().await.expect("sync workers closed");

                let request = DownloadRequestFile {
                    filename: file.filename.clone(),
                    size_bytes: file.size_bytes,
                    priority: file.priority,
                };

                if downloads
                    .update_state(file.id, DownloadState::Running)
                    .await
                    .is_err()
                {
                    return false;
                }

                let ticket = match gateway
                    .enqueue_peer_download(&username, std::slice::from_ref(&request))
                    .await
                {
                    Ok(ticket) => ticket,
                    Err(error) => {
                        record_failure(&downloads, &retry_policies, &file, &error.to_string()).await;
                        return false;
                    }
                };

                let mut interval_ms = poll_initial_ms;
                loop {
                    tokio::select! {
                        _ = cancellation.cancelled() => {
                            // lease lost or shutdown: cancel the transfer and
                            // let a retry pick the file up again
                            let _ = gateway.cancel_peer_download(&ticket).await;
                            record_failure(&downloads, &retry_policies, &file, "cancelled").await;
                            return false;
                        }
                        _ = tokio::time::sleep(std::time::Duration::from_millis(interval_ms)) => {}
                    }

                    match gateway.poll_peer_download(&ticket).await {
                        Ok(state) => match state {
                            harmony_providers::DownloadTicketState::Completed => {
                                let _ = downloads
                                    .update_state(file.id, DownloadState::Completed)
                                    .await;
                                return true;
                            }
                            harmony_providers::DownloadTicketState::Failed => {
                                record_failure(&downloads, &retry_policies, &file, "peer transfer failed")
                                    .await;
                                return false;
                            }
                            _ => {
                                interval_ms = (interval_ms * 2).min(poll_max_ms);
                            }
                        },
                        Err(error) => {
                            record_failure(&downloads, &retry_policies, &file, &error.to_string())
                                .await;
                            return false;
                        }
                    }
                }
            });
        }

        let mut completed = 0usize;
        let mut failed = 0usize;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(true) => completed += 1,
                Ok(false) => failed += 1,
                Err(error) => {
                    warn!(target: "handlers", %error, "sync worker panicked");
                    failed += 1;
                }
            }
        }

        info!(
            target: "handlers",
            event = "worker.job",
            job_id = %ctx.job_id,
            peer_username = %payload.peer_username,
            completed,
            failed,
            status = if completed > 0 { "ok" } else { "failed" },
        );

        // `failed == 0` with nothing run means every file had already
        // landed on a previous attempt
        if completed > 0 || failed == 0 {
            if let Some(raw_id) = payload.ingest_item_id {
                self.complete_ingest_item(IngestItemId::from_uuid(raw_id))
                    .await?;
            }
        }

        if completed > 0 || failed == 0 {
            Ok(HandlerOutcome::success())
        } else {
            Ok(HandlerOutcome::retryable(format!(
                "all {failed} file(s) failed"
            )))
        }
    }
}

async fn record_failure(
    downloads: &Arc<dyn DownloadRepository>,
    retry_policies: &Arc<RetryPolicyProvider>,
    file: &DownloadFile,
    error: &str,
) {
    let next_retry_at =
        retry_policies.next_retry_at(JobType::Sync, file.retry_count + 1, Utc::now());
    if let Err(db_error) = downloads
        .mark_failed(file.id, error, Some(next_retry_at))
        .await
    {
        warn!(
            target: "handlers",
            file_id = %file.id,
            %db_error,
            "failed to record download failure"
        );
    }
}
