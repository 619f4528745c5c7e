// src/collab/http.rs
//! reqwest-backed collaborator clients. Idempotent calls (scan, duplicate
//! check) retry transient failures with bounded exponential backoff; calls
//! with server-side effects (archive, remember) get exactly one attempt —
//! a lost response after the server may already have written the record
//! must surface as a failure, not a blind retry.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::collab::{ArchiveClient, MemoryClient, ScanClient};
use crate::rules::SourceConfig;
use crate::trace;
use crate::types::{ArchiveReceipt, ContentPack, NormalizedItem, RememberRequest};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 4_000;
const CALL_TIMEOUT_SECS: u64 = 40;

#[derive(Clone)]
pub struct HttpCollaborator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCollaborator {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(CALL_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post_json_once<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(trace::outbound_headers())
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .with_context(|| format!("POST {url}"))?;
        response
            .json::<T>()
            .await
            .with_context(|| format!("decoding response from {url}"))
    }

    /// Bounded retry for idempotent calls only.
    async fn post_json_retrying<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let mut backoff = Duration::from_millis(BACKOFF_BASE_MS);
        let mut attempt = 1;
        loop {
            match self.post_json_once(path, body).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < MAX_ATTEMPTS => {
                    warn!(path, attempt, error = %err, "collaborator call failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(BACKOFF_CAP_MS));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(serde::Deserialize)]
struct ScanResponse {
    #[serde(default)]
    items: Vec<NormalizedItem>,
}

#[async_trait::async_trait]
impl ScanClient for HttpCollaborator {
    async fn scan(&self, source: &SourceConfig) -> Result<Vec<NormalizedItem>> {
        let response: ScanResponse = self
            .post_json_retrying("/scan", &json!({ "source_config": source }))
            .await?;
        Ok(response.items)
    }
}

#[derive(serde::Deserialize)]
struct DuplicateCheckResponse {
    #[serde(default)]
    is_duplicate: bool,
}

#[derive(serde::Deserialize)]
struct CleanupResponse {
    #[serde(default)]
    removed: u64,
}

#[async_trait::async_trait]
impl MemoryClient for HttpCollaborator {
    async fn check_duplicate(&self, url_hash: &str) -> Result<bool> {
        let response: DuplicateCheckResponse = self
            .post_json_retrying("/check_duplicate", &json!({ "url_hash": url_hash }))
            .await?;
        Ok(response.is_duplicate)
    }

    async fn remember(&self, request: &RememberRequest) -> Result<()> {
        let _: serde_json::Value = self.post_json_once("/remember", request).await?;
        Ok(())
    }

    async fn cleanup(&self, retention_days: u32) -> Result<u64> {
        let response: CleanupResponse = self
            .post_json_once(
                &format!("/cleanup?retention_days={retention_days}"),
                &json!({}),
            )
            .await?;
        Ok(response.removed)
    }
}

#[async_trait::async_trait]
impl ArchiveClient for HttpCollaborator {
    async fn archive(&self, pack: &ContentPack) -> Result<ArchiveReceipt> {
        self.post_json_once("/archive", &json!({ "content_pack": pack }))
            .await
    }
}
