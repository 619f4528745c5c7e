// src/collab/mod.rs
//! Collaborator seams. The pipeline only ever talks to these traits; the
//! HTTP implementations live in `http`, tests plug in mocks.

pub mod http;

use std::sync::Arc;

use anyhow::Result;

use crate::rules::SourceConfig;
use crate::types::{ArchiveReceipt, ContentPack, NormalizedItem, RememberRequest};

/// Fetches and normalizes items for one configured source.
#[async_trait::async_trait]
pub trait ScanClient: Send + Sync {
    async fn scan(&self, source: &SourceConfig) -> Result<Vec<NormalizedItem>>;
}

/// Knowledge-base collaborator: duplicate checks, remembering processed
/// items, and retention cleanup.
#[async_trait::async_trait]
pub trait MemoryClient: Send + Sync {
    async fn check_duplicate(&self, url_hash: &str) -> Result<bool>;
    async fn remember(&self, request: &RememberRequest) -> Result<()>;
    /// Returns the number of records removed.
    async fn cleanup(&self, retention_days: u32) -> Result<u64>;
}

/// Durable archive collaborator; returns a reference URL for the record.
#[async_trait::async_trait]
pub trait ArchiveClient: Send + Sync {
    async fn archive(&self, pack: &ContentPack) -> Result<ArchiveReceipt>;
}

/// The bundle of collaborators a pipeline run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub scan: Arc<dyn ScanClient>,
    pub memory: Arc<dyn MemoryClient>,
    pub archive: Arc<dyn ArchiveClient>,
}
