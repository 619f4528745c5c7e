// src/rules.rs
//! Rule model + loader: the declarative configuration driving the scheduler,
//! its content fingerprint, and validation of everything the scheduler will
//! later rely on (intervals, HH:MM schedules, timezone, source id uniqueness).

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::interval::parse_interval;

pub const DEFAULT_RULES_PATH: &str = "./config/rules.yaml";
pub const ENV_RULES_PATH: &str = "RULES_PATH";

/// Keywords that mark an item as high-signal when no override is configured.
fn default_high_value_keywords() -> Vec<String> {
    [
        "agent",
        "benchmark",
        "paper",
        "sota",
        "launch",
        "release",
        "open source",
        "funding",
        "model",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("failed to read rules file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse rules file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unsupported interval format: {0:?}")]
    InvalidInterval(String),
    #[error("invalid HH:MM schedule: {0:?}")]
    InvalidSchedule(String),
    #[error("unknown timezone: {0:?}")]
    InvalidTimezone(String),
    #[error("duplicate source id: {0:?}")]
    DuplicateSourceId(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default = "default_source_type")]
    pub r#type: String,
    pub url: String,
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval: String,
    #[serde(default = "default_weight")]
    pub weight: i64,
    #[serde(default = "default_max_items")]
    pub max_items: u32,
}

fn default_source_type() -> String {
    "rss".to_string()
}
fn default_fetch_interval() -> String {
    "30m".to_string()
}
fn default_weight() -> i64 {
    1
}
fn default_max_items() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_style_prompt")]
    pub style_prompt: String,
    /// Daily publish time as "HH:MM"; a policy without one schedules nothing.
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub max_posts_per_day: Option<u32>,
    #[serde(default)]
    pub min_word_count: Option<u32>,
}

fn default_true() -> bool {
    true
}
fn default_style_prompt() -> String {
    "default".to_string()
}

impl Default for PlatformPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            style_prompt: default_style_prompt(),
            schedule: None,
            max_posts_per_day: None,
            min_word_count: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_retention_days")]
    pub memory_retention_days: u32,
    #[serde(default = "default_high_value_keywords")]
    pub high_value_keywords: Vec<String>,
}

fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}
fn default_retention_days() -> u32 {
    30
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            memory_retention_days: default_retention_days(),
            high_value_keywords: default_high_value_keywords(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisualConfig {
    #[serde(default = "default_visual_style")]
    pub default_style: String,
    #[serde(default = "default_visual_ratio")]
    pub default_ratio: String,
}

fn default_visual_style() -> String {
    "cyberpunk, data flow".to_string()
}
fn default_visual_ratio() -> String {
    "16:9".to_string()
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            default_style: default_visual_style(),
            default_ratio: default_visual_ratio(),
        }
    }
}

/// Aggregate root. Loaded as a whole, swapped as a whole — never patched
/// in place, so a pipeline run mid-flight keeps a consistent snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RulesConfig {
    #[serde(default, rename = "global")]
    pub global_config: GlobalConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub platforms: HashMap<String, PlatformPolicy>,
    #[serde(default)]
    pub visual: VisualConfig,
}

impl RulesConfig {
    /// Sources in scheduling order: descending weight, original order on ties.
    pub fn sources_by_weight(&self) -> Vec<&SourceConfig> {
        let mut out: Vec<&SourceConfig> = self.sources.iter().collect();
        out.sort_by_key(|s| std::cmp::Reverse(s.weight));
        out
    }

    /// Names of platforms currently enabled, in stable (sorted) order.
    pub fn enabled_platforms(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .platforms
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Opaque digest of the raw rules file bytes. Cheap change detector only.
pub type Fingerprint = String;

/// SHA-256 over the raw bytes; byte-identical files hash identically.
pub fn rules_fingerprint(path: &Path) -> Result<Fingerprint, RulesError> {
    let raw = fs::read(path).map_err(|source| RulesError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let digest = Sha256::digest(&raw);
    Ok(format!("{digest:x}"))
}

/// Parse the rules file and validate everything scheduling will depend on.
/// A failure here must leave any previously loaded topology untouched, so
/// all checks run before the caller swaps anything.
pub fn load_rules(path: &Path) -> Result<RulesConfig, RulesError> {
    let raw = fs::read_to_string(path).map_err(|source| RulesError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let rules: RulesConfig = serde_yaml::from_str(&raw)?;
    validate(&rules)?;
    Ok(rules)
}

fn validate(rules: &RulesConfig) -> Result<(), RulesError> {
    let mut seen = HashSet::new();
    for source in &rules.sources {
        if !seen.insert(source.id.as_str()) {
            return Err(RulesError::DuplicateSourceId(source.id.clone()));
        }
        parse_interval(&source.fetch_interval)?;
    }
    for policy in rules.platforms.values() {
        if policy.enabled {
            if let Some(schedule) = &policy.schedule {
                parse_schedule_hhmm(schedule)?;
            }
        }
    }
    resolve_timezone(&rules.global_config.timezone)?;
    Ok(())
}

/// "HH:MM" → (hour, minute), both range-checked.
pub fn parse_schedule_hhmm(raw: &str) -> Result<(u32, u32), RulesError> {
    let invalid = || RulesError::InvalidSchedule(raw.to_string());
    let (h, m) = raw.trim().split_once(':').ok_or_else(invalid)?;
    let hour: u32 = h.parse().map_err(|_| invalid())?;
    let minute: u32 = m.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok((hour, minute))
}

pub fn resolve_timezone(name: &str) -> Result<chrono_tz::Tz, RulesError> {
    name.parse::<chrono_tz::Tz>()
        .map_err(|_| RulesError::InvalidTimezone(name.to_string()))
}
