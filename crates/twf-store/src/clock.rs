//! Timestamp conventions.
//!
//! Rows are stamped with Asia/Taipei local time in RFC 3339 form (with
//! offset). Local stamps keep the day-prefix queries used by the risk
//! engine (`close_ts LIKE 'YYYY-MM-DD%'`) aligned with the trading day,
//! while the offset keeps every stamp unambiguous for age math.
//!
//! Readers must also cope with foreign timestamps: replayed recorder files
//! carry naive local stamps, exchange feeds carry `Z`-suffixed UTC.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Asia::Taipei;

/// Current row timestamp: Taipei local, millisecond precision, with offset.
pub fn now_iso(now_utc: DateTime<Utc>) -> String {
    now_utc
        .with_timezone(&Taipei)
        .to_rfc3339_opts(SecondsFormat::Millis, false)
}

/// Trading-day prefix (`YYYY-MM-DD`) on the Taipei calendar.
pub fn taipei_day(now_utc: DateTime<Utc>) -> String {
    now_utc.with_timezone(&Taipei).format("%Y-%m-%d").to_string()
}

/// Parse a timestamp of unknown pedigree into UTC.
///
/// Accepts RFC 3339 (any offset), a trailing `Z`, and naive ISO stamps,
/// which are interpreted as Taipei local time (recorder convention).
/// Returns `None` when nothing parses; the safety engine maps that to
/// `SAFETY_BIDASK_TS_INVALID` rather than skipping the event.
pub fn parse_ts_flexible(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    // Tolerate "Z" on otherwise non-RFC shapes (e.g. no fractional part).
    if let Some(stripped) = s.strip_suffix('Z') {
        if let Ok(naive) = NaiveDateTime::parse_from_str(stripped, "%Y-%m-%dT%H:%M:%S%.f") {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Taipei
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc));
    }

    None
}

/// Age of `ts` relative to `now_utc`, in seconds. Negative when `ts` is in
/// the future (clock skew); callers decide what to do with that.
pub fn age_seconds(ts: &str, now_utc: DateTime<Utc>) -> Option<f64> {
    let dt = parse_ts_flexible(ts)?;
    Some((now_utc - dt).num_milliseconds() as f64 / 1000.0)
}
