// src/types.rs
//! Wire and result types shared between the pipeline and its collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One scanned item, already normalized by the scan collaborator.
/// `url_hash` is the stable identity key used for deduplication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedItem {
    pub source_id: String,
    pub url_hash: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// What kind of record a ContentPack carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    /// A freshly discovered item, pending review.
    Topic,
    /// A generated post linked back to its originating topic.
    Draft,
}

/// Assembled record for one pipeline item, handed to the archive
/// collaborator. Built fresh per item, never persisted here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentPack {
    pub record_type: RecordType,
    pub trace_id: String,
    /// For drafts: the trace id of the topic they were generated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_trace_id: Option<String>,
    pub source_id: String,
    pub source_info: String,
    pub url_hash: String,
    pub title: String,
    pub source_url: String,
    pub topic_summary: String,
    #[serde(default)]
    pub ai_summary: String,
    pub image_url: String,
    pub image_urls: Vec<String>,
    pub channels: Vec<String>,
    pub status: String,
}

/// Everything the memory collaborator needs to index one archived item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RememberRequest {
    pub source_id: String,
    pub url_hash: String,
    pub title: String,
    pub url: String,
    pub summary: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub archive_url: String,
    #[serde(default)]
    pub image_url: String,
}

/// Archive collaborator acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveReceipt {
    #[serde(default)]
    pub reference_url: String,
    #[serde(default)]
    pub status: String,
}

/// Immutable summary of one finished source run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PulseRunResult {
    pub source_id: String,
    pub scanned: u64,
    pub processed: u64,
    pub duplicated: u64,
    pub filtered: u64,
    pub failed: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Mutable per-run accumulator, finalized into a `PulseRunResult`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunCounters {
    pub scanned: u64,
    pub processed: u64,
    pub duplicated: u64,
    pub filtered: u64,
    pub failed: u64,
}

impl RunCounters {
    pub fn finalize(
        self,
        source_id: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> PulseRunResult {
        PulseRunResult {
            source_id: source_id.to_string(),
            scanned: self.scanned,
            processed: self.processed,
            duplicated: self.duplicated,
            filtered: self.filtered,
            failed: self.failed,
            started_at,
            ended_at,
        }
    }
}
