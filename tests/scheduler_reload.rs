// tests/scheduler_reload.rs
//! Topology derivation and hot reload against temp rules files.

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Notify;

use feedpulse::collab::{ArchiveClient, Collaborators, MemoryClient, ScanClient};
use feedpulse::engine::PulseEngine;
use feedpulse::rules::SourceConfig;
use feedpulse::types::{ArchiveReceipt, ContentPack, NormalizedItem, RememberRequest};

struct EmptyScan;

#[async_trait]
impl ScanClient for EmptyScan {
    async fn scan(&self, _source: &SourceConfig) -> Result<Vec<NormalizedItem>> {
        Ok(vec![])
    }
}

/// Scan that parks until released, to keep a run in flight during reload.
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

struct NullMemory;

#[async_trait]
impl MemoryClient for NullMemory {
    async fn check_duplicate(&self, _url_hash: &str) -> Result<bool> {
        Ok(false)
    }
    async fn remember(&self, _request: &RememberRequest) -> Result<()> {
        Ok(())
    }
    async fn cleanup(&self, _retention_days: u32) -> Result<u64> {
        Ok(0)
    }
}

struct NullArchive;

#[async_trait]
impl ArchiveClient for NullArchive {
    async fn archive(&self, _pack: &ContentPack) -> Result<ArchiveReceipt> {
        Err(anyhow!("archive should not be called in this test"))
    }
}

fn collaborators(scan: Arc<dyn ScanClient>) -> Collaborators {
    Collaborators {
        scan,
        memory: Arc::new(NullMemory),
        archive: Arc::new(NullArchive),
    }
}

fn write_rules(file: &mut tempfile::NamedTempFile, content: &str) {
    use std::io::{Seek, SeekFrom};
    file.as_file_mut().set_len(0).expect("truncate");
    file.as_file_mut().seek(SeekFrom::Start(0)).expect("seek");
    file.write_all(content.as_bytes()).expect("write");
    file.flush().expect("flush");
}

const TWO_SOURCES: &str = r#"
global:
  timezone: UTC
sources:
  - id: feed_a
    url: http://example.test/a
    weight: 1
  - id: feed_b
    url: http://example.test/b
    weight: 9
platforms:
  twitter:
    enabled: true
    schedule: "09:30"
  drafts_only:
    enabled: true
"#;

const ONE_SOURCE: &str = r#"
global:
  timezone: UTC
sources:
  - id: feed_c
    url: http://example.test/c
"#;

fn source_labels(labels: &[String]) -> HashSet<String> {
    labels
        .iter()
        .filter(|l| l.starts_with("source::"))
        .cloned()
        .collect()
}

#[tokio::test]
async fn topology_matches_rules_and_weight_order() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write_rules(&mut file, TWO_SOURCES);

    let engine = PulseEngine::new(file.path().to_path_buf(), collaborators(Arc::new(EmptyScan)))
        .await
        .unwrap();
    assert!(engine.load_and_schedule(true).await.unwrap());

    let labels = engine.job_labels().await;
    // Heavier source installs first; platforms with a schedule get a cron
    // job; schedule-less platforms are inert; maintenance always present.
    assert_eq!(
        labels,
        vec![
            "source::feed_b",
            "source::feed_a",
            "platform::twitter",
            "maintenance::cleanup",
        ]
    );
    assert!(!engine.fingerprint().is_empty());
}

#[tokio::test]
async fn unforced_reload_short_circuits_on_same_fingerprint() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write_rules(&mut file, ONE_SOURCE);

    let engine = PulseEngine::new(file.path().to_path_buf(), collaborators(Arc::new(EmptyScan)))
        .await
        .unwrap();
    assert!(engine.load_and_schedule(true).await.unwrap());
    assert!(!engine.load_and_schedule(false).await.unwrap());
    // Changed bytes do reload without force.
    write_rules(&mut file, &format!("{ONE_SOURCE}# trailing comment\n"));
    assert!(engine.load_and_schedule(false).await.unwrap());
}

#[tokio::test]
async fn reload_replaces_source_job_set_exactly() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write_rules(&mut file, TWO_SOURCES);

    let engine = PulseEngine::new(file.path().to_path_buf(), collaborators(Arc::new(EmptyScan)))
        .await
        .unwrap();
    engine.load_and_schedule(true).await.unwrap();
    write_rules(&mut file, ONE_SOURCE);
    engine.load_and_schedule(true).await.unwrap();

    let labels = engine.job_labels().await;
    assert_eq!(
        source_labels(&labels),
        HashSet::from(["source::feed_c".to_string()])
    );
    // The old platform cron job went away with its rules.
    assert!(!labels.iter().any(|l| l.starts_with("platform::")));
}

#[tokio::test]
async fn broken_rules_keep_previous_topology() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write_rules(&mut file, TWO_SOURCES);

    let engine = PulseEngine::new(file.path().to_path_buf(), collaborators(Arc::new(EmptyScan)))
        .await
        .unwrap();
    engine.load_and_schedule(true).await.unwrap();
    let fingerprint_before = engine.fingerprint();
    let labels_before = engine.job_labels().await;

    for broken in [
        "sources: [unclosed\n",
        "sources:\n  - id: x\n    url: http://x\n    fetch_interval: nope\n",
        "sources:\n  - id: dup\n    url: http://a\n  - id: dup\n    url: http://b\n",
        "global:\n  timezone: Mars/Olympus\n",
    ] {
        write_rules(&mut file, broken);
        assert!(engine.load_and_schedule(true).await.is_err());
        assert_eq!(engine.fingerprint(), fingerprint_before);
        assert_eq!(engine.job_labels().await, labels_before);
    }
}

#[tokio::test]
async fn reload_during_inflight_run_does_not_disturb_it() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write_rules(&mut file, TWO_SOURCES);

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let engine = PulseEngine::new(
        file.path().to_path_buf(),
        collaborators(Arc::new(BlockingScan {
            entered: entered.clone(),
            release: release.clone(),
        })),
    )
    .await
    .unwrap();
    engine.load_and_schedule(true).await.unwrap();

    let inflight = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_source_by_id("feed_a").await })
    };
    entered.notified().await;

    // Swap the topology underneath the running pipeline.
    write_rules(&mut file, ONE_SOURCE);
    engine.load_and_schedule(true).await.unwrap();
    assert_eq!(
        source_labels(&engine.job_labels().await),
        HashSet::from(["source::feed_c".to_string()])
    );

    release.notify_one();
    let result = inflight.await.unwrap().unwrap();
    assert_eq!(result.source_id, "feed_a");
    assert_eq!(result.failed, 0);
}

#[tokio::test]
async fn run_by_unknown_id_is_not_found() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write_rules(&mut file, ONE_SOURCE);

    let engine = PulseEngine::new(file.path().to_path_buf(), collaborators(Arc::new(EmptyScan)))
        .await
        .unwrap();
    engine.load_and_schedule(true).await.unwrap();

    let err = engine.run_source_by_id("missing").await.unwrap_err();
    assert!(matches!(
        err,
        feedpulse::engine::EngineError::SourceNotFound(_)
    ));
}

#[tokio::test]
async fn status_reflects_fingerprint_jobs_and_last_runs() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write_rules(&mut file, ONE_SOURCE);

    let engine = PulseEngine::new(file.path().to_path_buf(), collaborators(Arc::new(EmptyScan)))
        .await
        .unwrap();
    engine.load_and_schedule(true).await.unwrap();
    engine.run_source_by_id("feed_c").await.unwrap();

    let status = engine.status().await;
    assert_eq!(status.fingerprint, engine.fingerprint());
    assert!(status.jobs.iter().any(|j| j.id == "source::feed_c"));
    assert!(status.jobs.iter().any(|j| j.id == "maintenance::cleanup"));
    assert_eq!(status.last_runs["feed_c"].scanned, 0);
}
