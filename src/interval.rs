// src/interval.rs
//! Parses human-readable fetch intervals ("30m", "2h") into durations.

use std::time::Duration;

use once_cell::sync::OnceCell;
use regex::Regex;

use crate::rules::RulesError;

fn interval_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)([mh])$").unwrap())
}

/// Convert `<integer><unit>` (unit `m` or `h`, case-insensitive, surrounding
/// whitespace ignored) into a `Duration`. Zero and anything else is rejected.
pub fn parse_interval(text: &str) -> Result<Duration, RulesError> {
    let normalized = text.trim().to_ascii_lowercase();
    let caps = interval_re()
        .captures(&normalized)
        .ok_or_else(|| RulesError::InvalidInterval(text.to_string()))?;

    let value: u64 = caps[1]
        .parse()
        .map_err(|_| RulesError::InvalidInterval(text.to_string()))?;
    if value == 0 {
        return Err(RulesError::InvalidInterval(text.to_string()));
    }

    let secs = match &caps[2] {
        "m" => value.checked_mul(60),
        "h" => value.checked_mul(3600),
        _ => unreachable!("regex only admits m|h"),
    }
    .ok_or_else(|| RulesError::InvalidInterval(text.to_string()))?;
    Ok(Duration::from_secs(secs))
}
