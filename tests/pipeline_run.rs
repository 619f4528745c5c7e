// tests/pipeline_run.rs
//! Pipeline counter semantics against mock collaborators.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use feedpulse::collab::{ArchiveClient, Collaborators, MemoryClient, ScanClient};
use feedpulse::pipeline::{PipelineRunner, RunError};
use feedpulse::rules::{RulesConfig, SourceConfig};
use feedpulse::state::RunState;
use feedpulse::types::{ArchiveReceipt, ContentPack, NormalizedItem, RememberRequest};

fn source() -> SourceConfig {
    SourceConfig {
        id: "feed_a".into(),
        r#type: "rss".into(),
        url: "http://example.test/a".into(),
        fetch_interval: "30m".into(),
        weight: 1,
        max_items: 5,
    }
}

fn rules() -> RulesConfig {
    RulesConfig::default()
}

fn item(url_hash: &str, raw_len: usize, images: usize) -> NormalizedItem {
    NormalizedItem {
        source_id: "feed_a".into(),
        url_hash: url_hash.into(),
        title: "plain title".into(),
        url: format!("https://example.test/{url_hash}"),
        summary: "a short summary".into(),
        raw_text: "x".repeat(raw_len),
        published_at: None,
        images: (0..images).map(|i| format!("https://img/{i}")).collect(),
        keywords: vec![],
    }
}

struct StaticScan {
    items: Vec<NormalizedItem>,
    fail: bool,
}

#[async_trait]
impl ScanClient for StaticScan {
    async fn scan(&self, _source: &SourceConfig) -> Result<Vec<NormalizedItem>> {
        if self.fail {
            return Err(anyhow!("scan collaborator unreachable"));
        }
        Ok(self.items.clone())
    }
}

/// Scan that parks until released, to hold a run open.
struct BlockingScan {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl ScanClient for BlockingScan {
    async fn scan(&self, _source: &SourceConfig) -> Result<Vec<NormalizedItem>> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(vec![])
    }
}

#[derive(Default)]
struct ScriptedMemory {
    duplicates: HashSet<String>,
    fail_check: bool,
    fail_remember: bool,
    checks: AtomicUsize,
    remembered: Mutex<Vec<RememberRequest>>,
}

#[async_trait]
impl MemoryClient for ScriptedMemory {
    async fn check_duplicate(&self, url_hash: &str) -> Result<bool> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.fail_check {
            return Err(anyhow!("memory collaborator unreachable"));
        }
        Ok(self.duplicates.contains(url_hash))
    }

    async fn remember(&self, request: &RememberRequest) -> Result<()> {
        if self.fail_remember {
            return Err(anyhow!("remember refused"));
        }
        self.remembered.lock().push(request.clone());
        Ok(())
    }

    async fn cleanup(&self, _retention_days: u32) -> Result<u64> {
        Ok(0)
    }
}

#[derive(Default)]
struct RecordingArchive {
    fail: bool,
    packs: Mutex<Vec<ContentPack>>,
}

#[async_trait]
impl ArchiveClient for RecordingArchive {
    async fn archive(&self, pack: &ContentPack) -> Result<ArchiveReceipt> {
        if self.fail {
            return Err(anyhow!("archive collaborator unreachable"));
        }
        self.packs.lock().push(pack.clone());
        Ok(ArchiveReceipt {
            reference_url: format!("https://archive.test/{}", pack.url_hash),
            status: "ok".into(),
        })
    }
}

struct Fixture {
    runner: PipelineRunner,
    memory: Arc<ScriptedMemory>,
    archive: Arc<RecordingArchive>,
}

fn fixture(
    scan: Arc<dyn ScanClient>,
    memory: ScriptedMemory,
    archive: RecordingArchive,
) -> Fixture {
    let memory = Arc::new(memory);
    let archive = Arc::new(archive);
    let collab = Collaborators {
        scan,
        memory: memory.clone(),
        archive: archive.clone(),
    };
    Fixture {
        runner: PipelineRunner::new(collab, Arc::new(RunState::default())),
        memory,
        archive,
    }
}

#[tokio::test]
async fn duplicate_filtered_and_processed_items_are_counted() {
    // A is a known duplicate, B fails the value filter, C passes everything.
    let a = item("aaaa11112222", 300, 1);
    let b = item("bbbb11112222", 10, 0);
    let c = item("cccc11112222", 300, 2);

    let mut memory = ScriptedMemory::default();
    memory.duplicates.insert(a.url_hash.clone());

    let fx = fixture(
        Arc::new(StaticScan {
            items: vec![a, b, c],
            fail: false,
        }),
        memory,
        RecordingArchive::default(),
    );

    let result = fx.runner.run_source(&source(), &rules()).await.unwrap();
    assert_eq!(result.scanned, 3);
    assert_eq!(result.duplicated, 1);
    assert_eq!(result.filtered, 1);
    assert_eq!(result.processed, 1);
    assert_eq!(result.failed, 0);
    assert!(result.ended_at >= result.started_at);

    // Only C reached archive + remember, carrying its trace id.
    let packs = fx.archive.packs.lock();
    assert_eq!(packs.len(), 1);
    assert_eq!(packs[0].url_hash, "cccc11112222");
    assert_eq!(packs[0].trace_id, "cccc1111");
    let remembered = fx.memory.remembered.lock();
    assert_eq!(remembered.len(), 1);
    assert_eq!(
        remembered[0].archive_url,
        "https://archive.test/cccc11112222"
    );

    // Result is stored in the run state tracker, last value wins.
    assert_eq!(fx.runner.state().last_run("feed_a").unwrap().processed, 1);
}

#[tokio::test]
async fn scan_failure_aborts_run_without_item_calls() {
    let fx = fixture(
        Arc::new(StaticScan {
            items: vec![],
            fail: true,
        }),
        ScriptedMemory::default(),
        RecordingArchive::default(),
    );

    let result = fx.runner.run_source(&source(), &rules()).await.unwrap();
    assert_eq!(result.scanned, 0);
    assert_eq!(result.failed, 1);
    assert_eq!(result.processed, 0);
    assert_eq!(fx.memory.checks.load(Ordering::SeqCst), 0);
    assert!(fx.archive.packs.lock().is_empty());
}

#[tokio::test]
async fn dedup_check_failure_marks_item_failed_and_continues() {
    let fx = fixture(
        Arc::new(StaticScan {
            items: vec![item("aaaa11112222", 300, 1), item("bbbb11112222", 300, 1)],
            fail: false,
        }),
        ScriptedMemory {
            fail_check: true,
            ..Default::default()
        },
        RecordingArchive::default(),
    );

    let result = fx.runner.run_source(&source(), &rules()).await.unwrap();
    assert_eq!(result.scanned, 2);
    assert_eq!(result.failed, 2);
    assert_eq!(result.processed, 0);
    // Both items were attempted; one bad item never aborts the batch.
    assert_eq!(fx.memory.checks.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn remember_failure_keeps_archive_but_counts_item_failed() {
    let fx = fixture(
        Arc::new(StaticScan {
            items: vec![item("cccc11112222", 300, 1)],
            fail: false,
        }),
        ScriptedMemory {
            fail_remember: true,
            ..Default::default()
        },
        RecordingArchive::default(),
    );

    let result = fx.runner.run_source(&source(), &rules()).await.unwrap();
    assert_eq!(result.processed, 0);
    assert_eq!(result.failed, 1);
    // Archived but not remembered: the archive call is not rolled back.
    assert_eq!(fx.archive.packs.lock().len(), 1);
}

#[tokio::test]
async fn archive_failure_counts_item_failed() {
    let fx = fixture(
        Arc::new(StaticScan {
            items: vec![item("cccc11112222", 300, 1)],
            fail: false,
        }),
        ScriptedMemory::default(),
        RecordingArchive {
            fail: true,
            ..Default::default()
        },
    );

    let result = fx.runner.run_source(&source(), &rules()).await.unwrap();
    assert_eq!(result.processed, 0);
    assert_eq!(result.failed, 1);
    assert!(fx.memory.remembered.lock().is_empty());
}

#[tokio::test]
async fn second_trigger_during_run_is_skipped() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let fx = fixture(
        Arc::new(BlockingScan {
            entered: entered.clone(),
            release: release.clone(),
        }),
        ScriptedMemory::default(),
        RecordingArchive::default(),
    );
    let runner = Arc::new(fx.runner);

    let first = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run_source(&source(), &rules()).await })
    };
    // Wait until the first run holds the per-source lock inside scan.
    entered.notified().await;

    let second = runner.run_source(&source(), &rules()).await;
    assert!(matches!(second, Err(RunError::Busy(id)) if id == "feed_a"));

    release.notify_one();
    let result = first.await.unwrap().unwrap();
    assert_eq!(result.scanned, 0);
    assert_eq!(result.failed, 0);

    // Lock released: the source can run again.
    let third = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run_source(&source(), &rules()).await })
    };
    entered.notified().await;
    release.notify_one();
    assert!(third.await.unwrap().is_ok());
}
