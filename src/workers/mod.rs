//! Lifecycle workers (C9): independent bus subscribers and timers that react
//! to loan/moderator/permission lifecycle events, grounded one-to-one on
//! `original_source/src/runners/*.py`. Each worker here is deliberately a
//! standalone async function — matching the one-runner-per-concern shape of
//! the original fleet — rather than a shared trait-object "worker" type,
//! since no two of them share a dispatch signature.
//!
//! The supervisor (`main.rs`) spawns each of these as its own tokio task and
//! tears down the whole fleet if any one of them returns or panics (§4.7,
//! §5's one-process-per-worker model, adapted to task-level isolation — see
//! DESIGN.md).

pub mod alerts;
pub mod links;
pub mod loan_events;
pub mod moderators;
pub mod requests;
pub mod stats;
pub mod trust;

use std::time::Duration;

use chrono::{TimeZone, Timelike, Utc};

/// How long to sleep, from `now`, until the next UTC `hour:minute` — today's
/// if it hasn't passed yet, tomorrow's otherwise. Grounded on
/// `original_source/src/runners/utils.py::sleep_until_hour_and_minute`.
pub(crate) fn duration_until(hour: u32, minute: u32, now: i64) -> Duration {
    let now_dt = Utc.timestamp_opt(now, 0).single().expect("valid unix timestamp");
    let mut target = now_dt.date_naive().and_hms_opt(hour, minute, 0).expect("valid hour/minute").and_utc();
    if now_dt.hour() > hour || (now_dt.hour() == hour && now_dt.minute() >= minute) {
        target += chrono::Duration::days(1);
    }
    let secs = (target.timestamp() - now).max(0);
    Duration::from_secs(secs as u64)
}

#[cfg(test)]
mod schedule_tests {
    use super::*;

    #[test]
    fn schedules_later_today_when_time_hasnt_passed() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap().timestamp();
        let d = duration_until(13, 0, now);
        assert_eq!(d, Duration::from_secs(5 * 3600));
    }

    #[test]
    fn schedules_tomorrow_once_the_minute_has_passed() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 13, 30, 0).unwrap().timestamp();
        let d = duration_until(13, 0, now);
        assert_eq!(d, Duration::from_secs(23 * 3600 + 30 * 60));
    }

    #[test]
    fn schedules_tomorrow_at_the_exact_minute() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap().timestamp();
        let d = duration_until(13, 0, now);
        assert_eq!(d, Duration::from_secs(24 * 3600));
    }
}
