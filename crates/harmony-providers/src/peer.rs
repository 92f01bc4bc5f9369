// SPDX-License-Identifier: GPL-3.0-or-later

//! Peer-to-peer daemon adapter.

use crate::error::{classify_status, ProviderError, Result};
use crate::metadata::retry_after_ms;
use crate::models::{
    DownloadRequestFile, DownloadTicket, DownloadTicketState, PeerResult, ProviderHealth,
};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::trace;
use url::Url;

const USER_AGENT: &str = concat!("Harmony/", env!("CARGO_PKG_VERSION"));

#[async_trait::async_trait]
pub trait PeerDaemon: Send + Sync {
    async fn search_peer(&self, query: &str) -> Result<Vec<PeerResult>>;
    async fn enqueue_download(
        &self,
        username: &str,
        files: &[DownloadRequestFile],
    ) -> Result<DownloadTicket>;
    async fn poll_download(&self, ticket: &DownloadTicket) -> Result<DownloadTicketState>;
    async fn cancel_download(&self, ticket: &DownloadTicket) -> Result<()>;
    async fn check_health(&self) -> Result<ProviderHealth>;
}

#[derive(Debug, Clone)]
pub struct HttpPeerDaemon {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpPeerDaemon {
    pub fn builder() -> HttpPeerDaemonBuilder {
        HttpPeerDaemonBuilder::default()
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| ProviderError::InvalidResponse(format!("invalid base url: {e}")))?;
        base.join(path)
            .map_err(|e| ProviderError::InvalidResponse(format!("invalid path {path}: {e}")))
    }

    async fn execute<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let request = match self.api_key.as_deref() {
            Some(key) => request.header("X-API-Key", key),
            None => request,
        };
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = retry_after_ms(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, retry_after_ms));
        }

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse response: {e}")))
    }
}

#[async_trait::async_trait]
impl PeerDaemon for HttpPeerDaemon {
    async fn search_peer(&self, query: &str) -> Result<Vec<PeerResult>> {
        let mut url = self.endpoint("/api/v0/searches")?;
        url.query_pairs_mut().append_pair("query", query);
        trace!(target: "providers", provider = "peer", %url, "search");
        let response: SearchResponse = self.execute(self.client.get(url)).await?;
        Ok(response.results)
    }

    async fn enqueue_download(
        &self,
        username: &str,
        files: &[DownloadRequestFile],
    ) -> Result<DownloadTicket> {
        let url = self.endpoint(&format!("/api/v0/transfers/downloads/{username}"))?;
        trace!(target: "providers", provider = "peer", %url, files = files.len(), "enqueue download");
        self.execute(self.client.post(url).json(&files)).await
    }

    async fn poll_download(&self, ticket: &DownloadTicket) -> Result<DownloadTicketState> {
        let url = self.endpoint(&format!(
            "/api/v0/transfers/downloads/{}/{}",
            ticket.username, ticket.id
        ))?;
        let response: TransferStateResponse = self.execute(self.client.get(url)).await?;
        Ok(response.state)
    }

    async fn cancel_download(&self, ticket: &DownloadTicket) -> Result<()> {
        let url = self.endpoint(&format!(
            "/api/v0/transfers/downloads/{}/{}",
            ticket.username, ticket.id
        ))?;
        let _: serde_json::Value = self.execute(self.client.delete(url)).await?;
        Ok(())
    }

    async fn check_health(&self) -> Result<ProviderHealth> {
        let url = self.endpoint("/health")?;
        self.execute(self.client.get(url)).await
    }
}

#[derive(Debug, serde::Deserialize)]
struct SearchResponse {
    results: Vec<PeerResult>,
}

#[derive(Debug, serde::Deserialize)]
struct TransferStateResponse {
    state: DownloadTicketState,
}

#[derive(Debug)]
pub struct HttpPeerDaemonBuilder {
    base_url: String,
    timeout: Duration,
    api_key: Option<String>,
}

impl Default for HttpPeerDaemonBuilder {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5030".to_string(),
            timeout: Duration::from_secs(20),
            api_key: None,
        }
    }
}

impl HttpPeerDaemonBuilder {
    /// Set a custom base URL (useful for testing with mock servers).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    pub fn build(self) -> Result<HttpPeerDaemon> {
        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::Permanent(format!("http client: {e}")))?;

        Ok(HttpPeerDaemon {
            client,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            api_key: self.api_key,
        })
    }
}
