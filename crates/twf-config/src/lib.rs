//! Environment-knob plumbing.
//!
//! Every component of the trading core is configured through a single
//! strongly-typed config struct built from the enumerated knobs below.
//! This crate owns the raw env access so components stay pure: they take a
//! config value, never read `std::env` themselves.
//!
//! It also produces the env snapshot recorded into the health-check payload
//! at startup (audit requirement), plus the canonical-JSON hash used to tag
//! that snapshot.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Enumerated knobs
// ---------------------------------------------------------------------------

/// SQLite database path (Event Store + State Store).
pub const ENV_DB_PATH: &str = "TWF_DB_PATH";
/// Futures contract code the safety/metrics readers look up (e.g. TMFB6).
pub const ENV_FOP_CODE: &str = "TWF_FOP_CODE";
/// Risk: 1 = reject intents without market metrics.
pub const ENV_STRICT_REQUIRE_MARKET_METRICS: &str = "TWF_STRICT_REQUIRE_MARKET_METRICS";
/// Risk: 1 = reject non-reduce-only intents without a stop price.
pub const ENV_STRICT_REQUIRE_STOP: &str = "TWF_STRICT_REQUIRE_STOP";
/// Safety: 1 = enforce the session window gate.
pub const ENV_REQUIRE_SESSION_OPEN: &str = "TWF_REQUIRE_SESSION_OPEN";
/// Safety: session open, HHMM local (e.g. "0845").
pub const ENV_SESSION_OPEN_HHMM: &str = "TWF_SESSION_OPEN_HHMM";
/// Safety: session close, HHMM local (e.g. "1345").
pub const ENV_SESSION_CLOSE_HHMM: &str = "TWF_SESSION_CLOSE_HHMM";
/// Safety: comma-separated YYYY-MM-DD halt days.
pub const ENV_HALT_DATES: &str = "TWF_HALT_DATES";
/// Safety: staleness threshold for the book feed, seconds.
pub const ENV_MAX_BIDASK_AGE_SECONDS: &str = "TWF_MAX_BIDASK_AGE_SECONDS";
/// Dev override: allow a stale book feed. Hard-disabled inside the session
/// window by the safety engine regardless of this flag.
pub const ENV_DEV_ALLOW_STALE_BIDASK: &str = "TWF_DEV_ALLOW_STALE_BIDASK";
/// Regression override: bypass the market-calendar gate entirely.
pub const ENV_IGNORE_MARKET_CALENDAR: &str = "TWF_IGNORE_MARKET_CALENDAR";
/// Single-instance lock directory for the paper runner.
pub const ENV_LOCK_DIR: &str = "TWF_LOCK_DIR";
/// Hard ceiling on children produced by the gateway split loop.
pub const ENV_SPLIT_MAX_CHILDREN: &str = "TWF_SPLIT_MAX_CHILDREN";

/// Every knob the system reads, in declaration order. The env snapshot
/// iterates this list; a knob missing from it is a bug, not a feature.
pub const KNOWN_KNOBS: &[&str] = &[
    ENV_DB_PATH,
    ENV_FOP_CODE,
    ENV_STRICT_REQUIRE_MARKET_METRICS,
    ENV_STRICT_REQUIRE_STOP,
    ENV_REQUIRE_SESSION_OPEN,
    ENV_SESSION_OPEN_HHMM,
    ENV_SESSION_CLOSE_HHMM,
    ENV_HALT_DATES,
    ENV_MAX_BIDASK_AGE_SECONDS,
    ENV_DEV_ALLOW_STALE_BIDASK,
    ENV_IGNORE_MARKET_CALENDAR,
    ENV_LOCK_DIR,
    ENV_SPLIT_MAX_CHILDREN,
];

// ---------------------------------------------------------------------------
// Typed readers
// ---------------------------------------------------------------------------

/// Raw string knob, `None` when unset or blank.
pub fn env_str(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.trim().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        }
        Err(_) => None,
    }
}

/// Truthy flag: `1/true/t/yes/y/on` (case-insensitive). Unset = `default`.
pub fn env_truthy(name: &str, default: bool) -> bool {
    match env_str(name) {
        Some(v) => matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "t" | "yes" | "y" | "on"
        ),
        None => default,
    }
}

/// Integer knob; unparsable values fall back to `default`.
pub fn env_i64(name: &str, default: i64) -> i64 {
    env_str(name)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

/// Float knob; unparsable values fall back to `default`.
pub fn env_f64(name: &str, default: f64) -> f64 {
    env_str(name)
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Env snapshot (audit)
// ---------------------------------------------------------------------------

/// Snapshot of every known knob currently set, for the startup health check.
///
/// Values whose knob name smells like a credential are redacted; none of the
/// enumerated knobs are secrets today, but the filter keeps it that way if
/// someone adds one.
pub fn env_snapshot() -> Value {
    let mut map = BTreeMap::new();
    for &knob in KNOWN_KNOBS {
        if let Some(v) = env_str(knob) {
            let upper = knob.to_ascii_uppercase();
            let redact = upper.contains("SECRET") || upper.contains("TOKEN") || upper.contains("PASSWORD");
            map.insert(knob.to_string(), if redact { "<redacted>".to_string() } else { v });
        }
    }
    serde_json::to_value(map).unwrap_or(Value::Null)
}

/// Canonical hash of the snapshot, recorded alongside it so two runs with
/// identical knobs are trivially comparable in the daily report.
pub fn env_snapshot_hash(snapshot: &Value) -> String {
    let canonical = canonicalize_json(snapshot);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Canonical JSON
// ---------------------------------------------------------------------------

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON. Stable across runs for hashing.
pub fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthy_parses_common_spellings() {
        std::env::set_var("TWF_TEST_TRUTHY_A", "yes");
        std::env::set_var("TWF_TEST_TRUTHY_B", "0");
        assert!(env_truthy("TWF_TEST_TRUTHY_A", false));
        assert!(!env_truthy("TWF_TEST_TRUTHY_B", true));
        assert!(env_truthy("TWF_TEST_TRUTHY_UNSET_X", true));
        std::env::remove_var("TWF_TEST_TRUTHY_A");
        std::env::remove_var("TWF_TEST_TRUTHY_B");
    }

    #[test]
    fn numeric_knobs_fall_back_on_garbage() {
        std::env::set_var("TWF_TEST_I64", "not-a-number");
        assert_eq!(env_i64("TWF_TEST_I64", 15), 15);
        std::env::set_var("TWF_TEST_I64", "42");
        assert_eq!(env_i64("TWF_TEST_I64", 15), 42);
        std::env::remove_var("TWF_TEST_I64");
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": {"z": 1, "a": 2}, "a": [ {"y": 1, "x": 2} ]});
        let b = json!({"a": [ {"x": 2, "y": 1} ], "b": {"a": 2, "z": 1}});
        assert_eq!(canonicalize_json(&a), canonicalize_json(&b));
    }

    #[test]
    fn snapshot_hash_is_stable() {
        let snap = json!({"TWF_FOP_CODE": "TMFB6", "TWF_MAX_BIDASK_AGE_SECONDS": "15"});
        assert_eq!(env_snapshot_hash(&snap), env_snapshot_hash(&snap.clone()));
    }
}
