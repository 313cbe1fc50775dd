//! Parses the "details" field of a moderator-log ban entry into a duration,
//! for distinguishing temporary bans from permanent ones (§6, C5).
//!
//! Grounded on `original_source/src/parsing/temp_ban_parser.py`.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TempBanParseError {
    #[error("invalid temporary ban details `{0}` (does not match regex)")]
    NoMatch(String),
    #[error("invalid temporary ban details `{0}` (unknown interval: {1})")]
    UnknownInterval(String, String),
}

static ALLOWED_DURATIONS: LazyLock<HashMap<&'static str, i64>> = LazyLock::new(|| {
    HashMap::from([
        ("second", 1),
        ("seconds", 1),
        ("minute", 60),
        ("minutes", 60),
        ("hour", 3600),
        ("hours", 3600),
        ("day", 86400),
        ("days", 86400),
        ("week", 604800),
        ("weeks", 604800),
    ])
});

/// Reddit's own "changed to" phrasing, tried first.
static CHANGED_TO_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)ban changed to\s+(?P<cnt>\d+)\s+(?P<interval>\S+)").unwrap());
/// The bare `"<n> <unit>"` form modlog also uses directly, tried as a fallback.
static BARE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(?P<cnt>\d+)\s+(?P<interval>\S+)").unwrap());

/// Parses e.g. `"3 days"` or `"Ban changed to 3 days"` into `259200` (seconds).
/// Tries the "changed to" phrasing first, then the bare `"<n> <unit>"` form
/// (§6 supplement: both patterns appear in modlog `details` text).
pub fn parse_temporary_ban(details: &str) -> Result<i64, TempBanParseError> {
    let caps = CHANGED_TO_REGEX
        .captures(details)
        .or_else(|| BARE_REGEX.captures(details))
        .ok_or_else(|| TempBanParseError::NoMatch(details.to_string()))?;
    let cnt: i64 = caps["cnt"].parse().expect("regex guarantees digits");
    let interval = &caps["interval"];

    ALLOWED_DURATIONS
        .get(interval)
        .map(|mult| cnt * mult)
        .ok_or_else(|| TempBanParseError::UnknownInterval(details.to_string(), interval.to_string()))
}
