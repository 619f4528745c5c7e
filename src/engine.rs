// src/engine.rs
//! Scheduler engine: derives the job topology from the rules file, hot
//! reloads it when the file's fingerprint changes, and dispatches source,
//! platform, and maintenance jobs.
//!
//! Topology swap discipline: everything that can fail (read, parse,
//! validation, job construction) happens before a single existing job is
//! removed. A broken edit to the rules file never tears down a working
//! topology; the watcher just retries on its next tick.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collab::Collaborators;
use crate::interval::parse_interval;
use crate::pipeline::{PipelineRunner, RunError};
use crate::rules::{
    load_rules, parse_schedule_hhmm, resolve_timezone, rules_fingerprint, Fingerprint, RulesConfig,
    SourceConfig,
};
use crate::state::RunState;
use crate::types::PulseRunResult;

/// Cadence of the rules-file fingerprint watcher.
const WATCH_INTERVAL: Duration = Duration::from_secs(60);
/// Daily memory-retention cleanup time in the configured timezone.
const MAINTENANCE_CRON: &str = "0 30 3 * * *";

const WATCHER_JOB_ID: &str = "config_watcher";
const MAINTENANCE_JOB_ID: &str = "maintenance::cleanup";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("rules not loaded")]
    RulesNotLoaded,
    #[error("source {0:?} not found")]
    SourceNotFound(String),
    #[error(transparent)]
    Run(#[from] RunError),
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub next_run_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub rules_path: String,
    pub fingerprint: Fingerprint,
    pub jobs: Vec<JobStatus>,
    pub last_runs: HashMap<String, PulseRunResult>,
}

struct JobEntry {
    uuid: Uuid,
    label: String,
}

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pulse_reloads_total", "Successful topology reloads.");
    });
}

/// Owns the live job set. Constructed once at startup and shared behind an
/// `Arc`; job closures hold a `Weak` back-reference so the scheduler never
/// keeps the engine alive on its own.
pub struct PulseEngine {
    rules_path: PathBuf,
    sched: JobScheduler,
    runner: PipelineRunner,
    collab: Collaborators,
    rules: RwLock<Option<Arc<RulesConfig>>>,
    fingerprint: RwLock<Fingerprint>,
    jobs: tokio::sync::Mutex<Vec<JobEntry>>,
    watcher: tokio::sync::Mutex<Option<Uuid>>,
}

impl PulseEngine {
    pub async fn new(rules_path: PathBuf, collab: Collaborators) -> Result<Arc<Self>> {
        let sched = JobScheduler::new()
            .await
            .map_err(|e| anyhow!("creating scheduler: {e}"))?;
        let runner = PipelineRunner::new(collab.clone(), Arc::new(RunState::default()));
        Ok(Arc::new(Self {
            rules_path,
            sched,
            runner,
            collab,
            rules: RwLock::new(None),
            fingerprint: RwLock::new(String::new()),
            jobs: tokio::sync::Mutex::new(Vec::new()),
            watcher: tokio::sync::Mutex::new(None),
        }))
    }

    /// Initial forced load-and-schedule, watcher installation, and tick
    /// start. Startup fails if the rules file does not parse.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.load_and_schedule(true).await?;
        self.install_watcher().await?;
        let mut sched = self.sched.clone();
        sched
            .start()
            .await
            .map_err(|e| anyhow!("starting scheduler: {e}"))?;
        info!("pulse scheduler started");
        Ok(())
    }

    /// Stop accepting new triggers. In-flight runs finish on their own.
    pub async fn stop(&self) -> Result<()> {
        let mut sched = self.sched.clone();
        sched
            .shutdown()
            .await
            .map_err(|e| anyhow!("stopping scheduler: {e}"))?;
        Ok(())
    }

    pub fn rules_snapshot(&self) -> Option<Arc<RulesConfig>> {
        self.rules.read().expect("rules lock poisoned").clone()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
            .read()
            .expect("fingerprint lock poisoned")
            .clone()
    }

    pub fn rules_path(&self) -> &PathBuf {
        &self.rules_path
    }

    fn weak(self: &Arc<Self>) -> Weak<Self> {
        Arc::downgrade(self)
    }

    async fn install_watcher(self: &Arc<Self>) -> Result<()> {
        let weak = self.weak();
        let job = Job::new_repeated_async(WATCH_INTERVAL, move |_uuid, _lock| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(engine) = weak.upgrade() {
                    engine.watch_rules().await;
                }
            })
        })
        .map_err(|e| anyhow!("creating watcher job: {e}"))?;

        let mut sched = self.sched.clone();
        let uuid = sched
            .add(job)
            .await
            .map_err(|e| anyhow!("adding watcher job: {e}"))?;
        *self.watcher.lock().await = Some(uuid);
        Ok(())
    }

    /// Watcher body: reload only when the fingerprint moved; any failure
    /// is logged and the current topology stays up.
    async fn watch_rules(self: &Arc<Self>) {
        match rules_fingerprint(&self.rules_path) {
            Ok(current) => {
                if current != self.fingerprint() {
                    info!("detected rules change, reloading jobs");
                    if let Err(err) = self.load_and_schedule(true).await {
                        error!(
                            error = %format!("{err:#}"),
                            "rules reload failed, keeping previous topology"
                        );
                    }
                }
            }
            Err(err) => error!(error = %err, "failed to watch rules file"),
        }
    }

    /// Parse, validate, and swap the job topology. Returns `false` when an
    /// unforced call found the fingerprint unchanged.
    pub async fn load_and_schedule(self: &Arc<Self>, force: bool) -> Result<bool> {
        ensure_metrics_described();

        let new_fingerprint = rules_fingerprint(&self.rules_path)?;
        if !force && new_fingerprint == self.fingerprint() {
            return Ok(false);
        }

        let rules = Arc::new(load_rules(&self.rules_path)?);
        let timezone = resolve_timezone(&rules.global_config.timezone)?;

        // Construct every job before touching the live set, so a failure
        // here leaves the previous topology running.
        let mut pending: Vec<(String, Job)> = Vec::new();

        for source in rules.sources_by_weight() {
            let interval = parse_interval(&source.fetch_interval)?;
            let weak = self.weak();
            let source = source.clone();
            let label = format!("source::{}", source.id);
            let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
                let weak = weak.clone();
                let source = source.clone();
                Box::pin(async move {
                    if let Some(engine) = weak.upgrade() {
                        engine.run_source_scheduled(&source).await;
                    }
                })
            })
            .map_err(|e| anyhow!("creating job {label}: {e}"))?;
            pending.push((label, job));
        }

        let mut platform_names: Vec<&String> = rules.platforms.keys().collect();
        platform_names.sort();
        for name in platform_names {
            let policy = &rules.platforms[name];
            let Some(schedule) = policy.schedule.as_deref().filter(|_| policy.enabled) else {
                continue;
            };
            let (hour, minute) = parse_schedule_hhmm(schedule)?;
            let cron = format!("0 {minute} {hour} * * *");
            let weak = self.weak();
            let platform = name.clone();
            let label = format!("platform::{name}");
            let job = Job::new_async_tz(cron.as_str(), timezone, move |_uuid, _lock| {
                let weak = weak.clone();
                let platform = platform.clone();
                Box::pin(async move {
                    if let Some(engine) = weak.upgrade() {
                        info!(platform = %platform, "platform schedule fired, running all sources");
                        engine.run_all_sources().await;
                    }
                })
            })
            .map_err(|e| anyhow!("creating job {label}: {e}"))?;
            pending.push((label, job));
        }

        {
            let weak = self.weak();
            let job = Job::new_async_tz(MAINTENANCE_CRON, timezone, move |_uuid, _lock| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(engine) = weak.upgrade() {
                        engine.cleanup_memory().await;
                    }
                })
            })
            .map_err(|e| anyhow!("creating job {MAINTENANCE_JOB_ID}: {e}"))?;
            pending.push((MAINTENANCE_JOB_ID.to_string(), job));
        }

        // Swap: tear down everything except the watcher, install the new
        // set, then publish the new rules snapshot.
        let mut jobs = self.jobs.lock().await;
        let mut sched = self.sched.clone();
        for entry in jobs.drain(..) {
            if let Err(err) = sched.remove(&entry.uuid).await {
                warn!(job = %entry.label, error = %err, "failed to remove job");
            }
        }
        for (label, job) in pending {
            let uuid = sched
                .add(job)
                .await
                .map_err(|e| anyhow!("adding job {label}: {e}"))?;
            jobs.push(JobEntry { uuid, label });
        }
        drop(jobs);

        let source_count = rules.sources.len();
        *self.rules.write().expect("rules lock poisoned") = Some(rules);
        *self.fingerprint.write().expect("fingerprint lock poisoned") = new_fingerprint;

        counter!("pulse_reloads_total").increment(1);
        info!(sources = source_count, "loaded source jobs");
        Ok(true)
    }

    async fn run_source_scheduled(&self, source: &SourceConfig) {
        let Some(rules) = self.rules_snapshot() else {
            warn!(source_id = %source.id, "trigger fired before rules were loaded");
            return;
        };
        // Busy means the previous run is still going; the runner already
        // counted and logged the skip.
        let _ = self.runner.run_source(source, &rules).await;
    }

    /// Run every configured source sequentially in descending weight
    /// order. Busy sources are skipped.
    pub async fn run_all_sources(&self) -> Vec<PulseRunResult> {
        let Some(rules) = self.rules_snapshot() else {
            return Vec::new();
        };
        let mut results = Vec::new();
        for source in rules.sources_by_weight() {
            match self.runner.run_source(source, &rules).await {
                Ok(result) => results.push(result),
                Err(RunError::Busy(_)) => {}
            }
        }
        results
    }

    /// On-demand run of one named source.
    pub async fn run_source_by_id(&self, source_id: &str) -> Result<PulseRunResult, EngineError> {
        let rules = self.rules_snapshot().ok_or(EngineError::RulesNotLoaded)?;
        let source = rules
            .sources
            .iter()
            .find(|s| s.id == source_id)
            .ok_or_else(|| EngineError::SourceNotFound(source_id.to_string()))?;
        Ok(self.runner.run_source(source, &rules).await?)
    }

    /// Daily retention cleanup against the memory collaborator. Failures
    /// are logged; the next day's trigger retries.
    async fn cleanup_memory(&self) {
        let Some(rules) = self.rules_snapshot() else {
            return;
        };
        let days = rules.global_config.memory_retention_days;
        match self.collab.memory.cleanup(days).await {
            Ok(removed) => info!(retention_days = days, removed, "memory cleanup done"),
            Err(err) => error!(error = %format!("{err:#}"), "memory cleanup failed"),
        }
    }

    /// Read-only snapshot for the status endpoint. Locks are held only
    /// long enough to copy.
    pub async fn status(&self) -> StatusSnapshot {
        let mut sched = self.sched.clone();
        let mut job_statuses = Vec::new();

        if let Some(uuid) = *self.watcher.lock().await {
            let next = sched.next_tick_for_job(uuid).await.ok().flatten();
            job_statuses.push(JobStatus {
                id: WATCHER_JOB_ID.to_string(),
                next_run_time: next,
            });
        }
        for entry in self.jobs.lock().await.iter() {
            let next = sched.next_tick_for_job(entry.uuid).await.ok().flatten();
            job_statuses.push(JobStatus {
                id: entry.label.clone(),
                next_run_time: next,
            });
        }

        StatusSnapshot {
            rules_path: self.rules_path.display().to_string(),
            fingerprint: self.fingerprint(),
            jobs: job_statuses,
            last_runs: self.runner.state().snapshot(),
        }
    }

    /// Installed runtime job labels (excluding the watcher), in install
    /// order.
    pub async fn job_labels(&self) -> Vec<String> {
        self.jobs
            .lock()
            .await
            .iter()
            .map(|e| e.label.clone())
            .collect()
    }
}

/// Resolve the rules path from the environment.
pub fn rules_path_from_env() -> PathBuf {
    std::env::var(crate::rules::ENV_RULES_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(crate::rules::DEFAULT_RULES_PATH))
}

/// Build HTTP collaborators from the environment.
pub fn collaborators_from_env() -> Collaborators {
    use crate::collab::http::HttpCollaborator;

    let sentry = std::env::var("SENTRY_API").unwrap_or_else(|_| "http://sentry:8000".to_string());
    let hippocampus =
        std::env::var("HIPPOCAMPUS_API").unwrap_or_else(|_| "http://hippocampus:8000".to_string());
    let archivist =
        std::env::var("ARCHIVIST_API").unwrap_or_else(|_| "http://archivist:8000".to_string());

    Collaborators {
        scan: Arc::new(HttpCollaborator::new(sentry)),
        memory: Arc::new(HttpCollaborator::new(hippocampus)),
        archive: Arc::new(HttpCollaborator::new(archivist)),
    }
}
