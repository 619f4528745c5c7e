// src/pipeline.rs
//! Per-source pipeline: scan → duplicate check → value filter → archive →
//! remember, with per-item error isolation and per-item trace contexts.

use std::sync::Arc;

use chrono::Utc;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{error, info, warn, Instrument};

use crate::collab::Collaborators;
use crate::rules::{RulesConfig, SourceConfig};
use crate::state::{RunState, SourceLocks};
use crate::trace::{self, TraceContext};
use crate::types::{
    ContentPack, NormalizedItem, PulseRunResult, RecordType, RememberRequest, RunCounters,
};

/// Minimum raw-text length contributing one point to the value score.
const MIN_RAW_TEXT_LEN: usize = 220;
/// Points required for an item to pass the value filter.
const HIGH_VALUE_THRESHOLD: u32 = 2;
/// Channels used when no platform is enabled at all.
const FALLBACK_CHANNELS: [&str; 2] = ["twitter", "wechat_blog"];

const STATUS_PENDING_REVIEW: &str = "pending_review";

#[derive(Debug, Error)]
pub enum RunError {
    /// A run of this source is already in flight; the trigger was skipped.
    #[error("source {0:?} already has a run in flight")]
    Busy(String),
}

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pulse_runs_total", "Completed source runs.");
        describe_counter!(
            "pulse_runs_skipped_total",
            "Triggers skipped because a run was already in flight."
        );
        describe_counter!("pulse_items_scanned_total", "Items returned by scans.");
        describe_counter!(
            "pulse_items_processed_total",
            "Items archived and remembered."
        );
        describe_counter!(
            "pulse_items_duplicated_total",
            "Items dropped as known duplicates."
        );
        describe_counter!(
            "pulse_items_filtered_total",
            "Items dropped by the value filter."
        );
        describe_counter!("pulse_items_failed_total", "Items that failed processing.");
        describe_gauge!("pulse_last_run_ts", "Unix ts of the last finished run.");
    });
}

/// Runs source pipelines against the collaborator seam, records outcomes.
pub struct PipelineRunner {
    collab: Collaborators,
    state: Arc<RunState>,
    locks: SourceLocks,
}

enum ItemOutcome {
    Processed,
    Duplicated,
    Filtered,
    Failed,
}

impl PipelineRunner {
    pub fn new(collab: Collaborators, state: Arc<RunState>) -> Self {
        Self {
            collab,
            state,
            locks: SourceLocks::default(),
        }
    }

    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    /// One full cycle for one source. Holds the per-source lock for the
    /// whole run; a concurrent trigger gets `RunError::Busy` (skip policy).
    pub async fn run_source(
        &self,
        source: &SourceConfig,
        rules: &RulesConfig,
    ) -> Result<PulseRunResult, RunError> {
        ensure_metrics_described();

        let Some(_guard) = self.locks.try_acquire(&source.id) else {
            counter!("pulse_runs_skipped_total").increment(1);
            warn!(source_id = %source.id, "run already in flight, skipping trigger");
            return Err(RunError::Busy(source.id.clone()));
        };

        let started_at = Utc::now();
        let mut counters = RunCounters::default();
        info!(source_id = %source.id, "heartbeat start");

        match self.collab.scan.scan(source).await {
            Ok(items) => {
                counters.scanned = items.len() as u64;
                for item in &items {
                    let trace_id = item_trace_id(item, &source.id);
                    let span = tracing::info_span!("item", trace_id = %trace_id, source_id = %source.id);
                    let outcome = trace::with_trace(
                        TraceContext::new(&trace_id),
                        self.process_item(item, source, rules, &trace_id),
                    )
                    .instrument(span)
                    .await;

                    match outcome {
                        ItemOutcome::Processed => counters.processed += 1,
                        ItemOutcome::Duplicated => counters.duplicated += 1,
                        ItemOutcome::Filtered => counters.filtered += 1,
                        ItemOutcome::Failed => counters.failed += 1,
                    }
                }
            }
            Err(err) => {
                counters.failed += 1;
                error!(source_id = %source.id, error = %format!("{err:#}"), "scan failed");
            }
        }

        let ended_at = Utc::now();
        let result = counters.finalize(&source.id, started_at, ended_at);
        self.state.record(result.clone());

        counter!("pulse_runs_total").increment(1);
        counter!("pulse_items_scanned_total").increment(counters.scanned);
        counter!("pulse_items_processed_total").increment(counters.processed);
        counter!("pulse_items_duplicated_total").increment(counters.duplicated);
        counter!("pulse_items_filtered_total").increment(counters.filtered);
        counter!("pulse_items_failed_total").increment(counters.failed);
        gauge!("pulse_last_run_ts").set(ended_at.timestamp().max(0) as f64);

        info!(
            source_id = %source.id,
            scanned = result.scanned,
            processed = result.processed,
            duplicated = result.duplicated,
            filtered = result.filtered,
            failed = result.failed,
            "heartbeat done"
        );
        Ok(result)
    }

    /// One item end to end. Every failure is absorbed here so one bad item
    /// never aborts the batch.
    async fn process_item(
        &self,
        item: &NormalizedItem,
        source: &SourceConfig,
        rules: &RulesConfig,
        trace_id: &str,
    ) -> ItemOutcome {
        match self.collab.memory.check_duplicate(&item.url_hash).await {
            Ok(true) => return ItemOutcome::Duplicated,
            Ok(false) => {}
            Err(err) => {
                error!(error = %format!("{err:#}"), "duplicate check failed");
                return ItemOutcome::Failed;
            }
        }

        if !is_high_value(item, &rules.global_config.high_value_keywords) {
            return ItemOutcome::Filtered;
        }

        let pack = build_topic_pack(item, source, rules, trace_id);
        let receipt = match self.collab.archive.archive(&pack).await {
            Ok(receipt) => receipt,
            Err(err) => {
                error!(error = %format!("{err:#}"), "archive failed");
                return ItemOutcome::Failed;
            }
        };

        // Archive is not rolled back if remember fails: an archived-but-not-
        // remembered item beats losing the archived work.
        let remember = RememberRequest {
            source_id: source.id.clone(),
            url_hash: item.url_hash.clone(),
            title: item.title.clone(),
            url: item.url.clone(),
            summary: pack.topic_summary.clone(),
            keywords: item.keywords.clone(),
            raw_text: item.raw_text.clone(),
            archive_url: receipt.reference_url.clone(),
            image_url: item.images.first().cloned().unwrap_or_default(),
        };
        if let Err(err) = self.collab.memory.remember(&remember).await {
            error!(error = %format!("{err:#}"), "remember failed after archive");
            return ItemOutcome::Failed;
        }

        ItemOutcome::Processed
    }
}

/// Trace id for one item: first 8 chars of its identity key, falling back
/// to the source id for items without one.
fn item_trace_id(item: &NormalizedItem, source_id: &str) -> String {
    let seed = item.url_hash.trim();
    if seed.is_empty() {
        source_id.to_string()
    } else {
        seed.chars().take(8).collect()
    }
}

/// Value filter: an item is high value iff at least two of — long enough
/// raw text, at least one image, a configured keyword in title+text+summary.
pub fn is_high_value(item: &NormalizedItem, keywords: &[String]) -> bool {
    let mut score = 0u32;
    if item.raw_text.chars().count() >= MIN_RAW_TEXT_LEN {
        score += 1;
    }
    if !item.images.is_empty() {
        score += 1;
    }
    let merged = format!("{}\n{}\n{}", item.title, item.raw_text, item.summary).to_lowercase();
    if keywords
        .iter()
        .any(|k| !k.is_empty() && merged.contains(&k.to_lowercase()))
    {
        score += 1;
    }
    score >= HIGH_VALUE_THRESHOLD
}

/// Platform slug derived from the source id, carried into the ContentPack.
pub fn source_info_from_id(source_id: &str) -> String {
    let raw = source_id.trim().to_lowercase();
    if raw.is_empty() {
        return "unknown-unknown".to_string();
    }
    if let Some(suffix) = raw.strip_prefix("twitter_") {
        return format!("twitter-{}", suffix.replace("_live", ""));
    }
    if let Some(suffix) = raw.strip_prefix("wechat_") {
        return format!("wechat-{}", suffix.replace("_live", ""));
    }
    if raw.starts_with("xhs_") || raw.contains("xiaohongshu") {
        return format!("xiaohongshu-{}", raw.replace("_live", ""));
    }
    raw
}

fn build_topic_pack(
    item: &NormalizedItem,
    source: &SourceConfig,
    rules: &RulesConfig,
    trace_id: &str,
) -> ContentPack {
    let summary_seed = if item.summary.is_empty() {
        &item.raw_text
    } else {
        &item.summary
    };
    let topic_summary: String = summary_seed.chars().take(240).collect();

    let mut channels = rules.enabled_platforms();
    if channels.is_empty() {
        channels = FALLBACK_CHANNELS.iter().map(|s| s.to_string()).collect();
    }

    ContentPack {
        record_type: RecordType::Topic,
        trace_id: trace_id.to_string(),
        topic_trace_id: None,
        source_id: source.id.clone(),
        source_info: source_info_from_id(&source.id),
        url_hash: item.url_hash.clone(),
        title: item.title.clone(),
        source_url: item.url.clone(),
        topic_summary,
        ai_summary: String::new(),
        image_url: item.images.first().cloned().unwrap_or_default(),
        image_urls: item.images.iter().take(3).cloned().collect(),
        channels,
        status: STATUS_PENDING_REVIEW.to_string(),
    }
}
