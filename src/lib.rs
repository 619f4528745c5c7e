// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod api;
pub mod collab;
pub mod engine;
pub mod interval;
pub mod metrics;
pub mod pipeline;
pub mod rules;
pub mod state;
pub mod trace;
pub mod types;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_router, AppState};
pub use crate::engine::{EngineError, PulseEngine, StatusSnapshot};
pub use crate::interval::parse_interval;
pub use crate::rules::{load_rules, rules_fingerprint, RulesConfig, RulesError};
pub use crate::types::{ContentPack, NormalizedItem, PulseRunResult};
