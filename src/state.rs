// src/state.rs
//! Run state tracker and the per-source run locks.
//!
//! Overlap policy is SKIP: a trigger that finds its source's lock held does
//! not run and does not wait. The scheduler keeps firing on its interval,
//! so the next armed tick is the coalesced catch-up run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::PulseRunResult;

/// Last run summary per source id. Written by at most one run per source
/// at a time; read concurrently by status queries.
#[derive(Default)]
pub struct RunState {
    last_runs: RwLock<HashMap<String, PulseRunResult>>,
}

impl RunState {
    pub fn record(&self, result: PulseRunResult) {
        let mut map = self.last_runs.write().expect("run state lock poisoned");
        map.insert(result.source_id.clone(), result);
    }

    pub fn snapshot(&self) -> HashMap<String, PulseRunResult> {
        self.last_runs
            .read()
            .expect("run state lock poisoned")
            .clone()
    }

    pub fn last_run(&self, source_id: &str) -> Option<PulseRunResult> {
        self.last_runs
            .read()
            .expect("run state lock poisoned")
            .get(source_id)
            .cloned()
    }
}

/// One async mutex per source id, created on first use. Lock lifetime spans
/// a whole `run_source` call.
#[derive(Default)]
pub struct SourceLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

pub type RunGuard = OwnedMutexGuard<()>;

impl SourceLocks {
    fn lock_for(&self, source_id: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.locks.lock().expect("source locks poisoned");
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Acquire without waiting; `None` means a run is already in flight.
    pub fn try_acquire(&self, source_id: &str) -> Option<RunGuard> {
        self.lock_for(source_id).try_lock_owned().ok()
    }
}
