//! Taiwan market-calendar gate.
//!
//! Blocks on weekends, on the static closure table below, and in the
//! 13:45-15:00 gap between the regular close and the after-hours open.
//! Bypasses: `allow_market_closed` / `sim_mode` / `paper_mode` meta flags
//! and the env override knob (plumbed by the caller as `env_bypass`).

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use chrono_tz::Asia::Taipei;
use serde_json::{json, Value};

use twf_schemas::intent::meta_truthy;
use twf_schemas::Verdict;

/// TAIFEX closure dates for 2026 (weekday closures only; weekends are
/// handled by the weekday rule). Covers New Year, the Lunar New Year
/// block, the 228 make-up day, Children's Day / Tomb Sweeping, Labor Day,
/// Dragon Boat, Mid-Autumn and the National Day make-up.
///
/// Dates outside 2026 fall back to the weekday rule alone; a calendar
/// provider must be authoritative for any later year.
const CLOSED_DATES_2026: &[&str] = &[
    "2026-01-01", // New Year's Day
    "2026-02-16", // Lunar New Year
    "2026-02-17",
    "2026-02-18",
    "2026-02-19",
    "2026-02-20",
    "2026-02-27", // Peace Memorial Day (observed)
    "2026-04-03", // Children's Day (observed)
    "2026-04-06", // Tomb Sweeping Day (observed)
    "2026-05-01", // Labor Day
    "2026-06-19", // Dragon Boat Festival
    "2026-09-25", // Mid-Autumn Festival
    "2026-10-09", // National Day (observed)
];

/// Evaluate the calendar gate at `now`.
///
/// Returns an allow verdict with an explicit override code when bypassed,
/// `EXEC_MARKET_CLOSED` when blocked, plain `OK` otherwise.
pub fn market_open_verdict(now: DateTime<Utc>, meta: &Value, env_bypass: bool) -> Verdict {
    // Meta overrides first: sims and paper smoke flows run off-calendar.
    if meta_truthy(meta, "allow_market_closed")
        || meta_truthy(meta, "sim_mode")
        || meta_truthy(meta, "paper_mode")
    {
        let keys: Vec<&str> = match meta.as_object() {
            Some(m) => m.keys().map(String::as_str).collect(),
            None => Vec::new(),
        };
        return Verdict::pass_with(
            "OK_MARKET_OVERRIDE",
            "market closed gate bypassed by meta override",
            json!({ "meta_keys": keys }),
        );
    }

    let local = now.with_timezone(&Taipei);
    let date = local.format("%Y-%m-%d").to_string();

    if env_bypass {
        return Verdict::pass_with(
            "OK_MARKET_ENV_OVERRIDE",
            "market calendar bypassed by env",
            json!({ "env": twf_config::ENV_IGNORE_MARKET_CALENDAR, "date": date }),
        );
    }

    // Weekend: Saturday = 5, Sunday = 6 (Monday-indexed weekday number).
    let weekday = local.weekday().num_days_from_monday();
    if weekday >= 5 {
        return Verdict::block(
            "EXEC_MARKET_CLOSED",
            "weekend market closed",
            json!({ "date": date, "weekday": weekday }),
        );
    }

    if CLOSED_DATES_2026.contains(&date.as_str()) {
        return Verdict::block(
            "EXEC_MARKET_CLOSED",
            "holiday market closed",
            json!({ "date": date }),
        );
    }

    // Gap between regular close and after-hours open.
    let t = local.time();
    let gap_start = NaiveTime::from_hms_opt(13, 45, 0).unwrap();
    let gap_end = NaiveTime::from_hms_opt(15, 0, 0).unwrap();
    if t > gap_start && t < gap_end {
        return Verdict::block(
            "EXEC_MARKET_CLOSED",
            "between regular close and after-hours open",
            json!({ "date": date, "time": t.format("%H:%M:%S").to_string() }),
        );
    }

    Verdict::pass_with(
        "OK",
        "market open",
        json!({ "date": date, "time": t.format("%H:%M:%S").to_string() }),
    )
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use twf_store::clock::parse_ts_flexible;

    fn at(s: &str) -> DateTime<Utc> {
        parse_ts_flexible(s).unwrap()
    }

    #[test]
    fn weekday_mid_session_is_open() {
        // 2026-01-29 is a Thursday.
        let v = market_open_verdict(at("2026-01-29T10:00:00+08:00"), &Value::Null, false);
        assert!(v.ok);
        assert_eq!(v.code, "OK");
    }

    #[test]
    fn weekend_is_closed() {
        // 2026-01-31 is a Saturday.
        let v = market_open_verdict(at("2026-01-31T10:00:00+08:00"), &Value::Null, false);
        assert!(!v.ok);
        assert_eq!(v.code, "EXEC_MARKET_CLOSED");
    }

    #[test]
    fn lunar_new_year_is_closed() {
        // 2026-02-17 is a Tuesday inside the closure block.
        let v = market_open_verdict(at("2026-02-17T10:00:00+08:00"), &Value::Null, false);
        assert_eq!(v.code, "EXEC_MARKET_CLOSED");
        assert_eq!(v.reason, "holiday market closed");
    }

    #[test]
    fn session_break_is_closed() {
        let v = market_open_verdict(at("2026-01-29T14:00:00+08:00"), &Value::Null, false);
        assert_eq!(v.code, "EXEC_MARKET_CLOSED");
        assert!(v.reason.contains("after-hours"));
        // Boundary: 13:45 sharp is still regular session.
        let edge = market_open_verdict(at("2026-01-29T13:45:00+08:00"), &Value::Null, false);
        assert!(edge.ok);
        // After-hours reopens at 15:00.
        let reopen = market_open_verdict(at("2026-01-29T15:00:00+08:00"), &Value::Null, false);
        assert!(reopen.ok);
    }

    #[test]
    fn meta_override_bypasses_weekend() {
        let meta = json!({"paper_mode": true});
        let v = market_open_verdict(at("2026-01-31T10:00:00+08:00"), &meta, false);
        assert!(v.ok);
        assert_eq!(v.code, "OK_MARKET_OVERRIDE");
    }

    #[test]
    fn env_override_bypasses_holiday() {
        let v = market_open_verdict(at("2026-02-17T10:00:00+08:00"), &Value::Null, true);
        assert!(v.ok);
        assert_eq!(v.code, "OK_MARKET_ENV_OVERRIDE");
    }
}
