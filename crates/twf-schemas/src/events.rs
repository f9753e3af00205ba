//! Event-log payload schemas.
//!
//! Producers append rows with one of the `KIND_*` tags and a JSON payload.
//! Unknown kinds are stored untouched and ignored by consumers, so the
//! payload structs here are deliberately permissive: missing arrays decode
//! to empty, missing flags to `false`.

use serde::{Deserialize, Serialize};

// Market-data kinds.
pub const KIND_BIDASK_FOP: &str = "bidask_fop_v1";
pub const KIND_TICK_FOP: &str = "tick_fop_v1";

// Recorder lifecycle kinds.
pub const KIND_SESSION_START: &str = "session_start";
pub const KIND_SESSION_READY: &str = "session_ready";
pub const KIND_SUBSCRIBE_OK: &str = "subscribe_ok";
pub const KIND_SESSION_STOP: &str = "session_stop";
pub const KIND_SESSION_ERROR: &str = "session_error";

/// Asset class tags used by the bar table.
pub const ASSET_CLASS_FOP: &str = "FOP";
pub const ASSET_CLASS_STK: &str = "STK";

// ---------------------------------------------------------------------------
// Book snapshot payload
// ---------------------------------------------------------------------------

/// L1/L2 book snapshot (`bidask_fop_v1`).
///
/// Freshness consumers prefer `recv_ts` (recorder-side receive clock) over
/// `ingest_ts` over the outer event timestamp, because the outer `ts` may be
/// exchange time from a replayed file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BookPayload {
    pub code: String,
    #[serde(default)]
    pub bid_price: Vec<f64>,
    #[serde(default)]
    pub ask_price: Vec<f64>,
    #[serde(default)]
    pub bid_volume: Vec<f64>,
    #[serde(default)]
    pub ask_volume: Vec<f64>,
    /// True for injected test seeds; excluded by safety and metrics readers
    /// unless explicitly allowed.
    #[serde(default)]
    pub synthetic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recv_ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest_ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
}

impl BookPayload {
    /// Top-of-book bid (level 1), if present.
    pub fn best_bid(&self) -> Option<f64> {
        self.bid_price.first().copied()
    }

    /// Top-of-book ask (level 1), if present.
    pub fn best_ask(&self) -> Option<f64> {
        self.ask_price.first().copied()
    }

    /// The timestamp string freshness checks should use, in preference
    /// order: `recv_ts`, `ingest_ts`, then the caller-supplied outer ts.
    pub fn freshness_ts<'a>(&'a self, outer_ts: &'a str) -> &'a str {
        self.recv_ts
            .as_deref()
            .or(self.ingest_ts.as_deref())
            .unwrap_or(outer_ts)
    }
}

// ---------------------------------------------------------------------------
// Tick payload
// ---------------------------------------------------------------------------

/// A single trade print (`tick_fop_v1`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TickPayload {
    pub code: String,
    pub price: f64,
    #[serde(default)]
    pub qty: f64,
    #[serde(default)]
    pub is_buy: bool,
    /// Exchange timestamp when the recorder provides one; bar building
    /// prefers it over the outer event ts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<String>,
}

// ---------------------------------------------------------------------------
// Bar
// ---------------------------------------------------------------------------

/// One 1-minute bar. `ts_min` is ISO-8601 with seconds zeroed; the composite
/// key (`ts_min`, `asset_class`, `symbol`) is unique (upsert on rebuild).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts_min: String,
    pub asset_class: String,
    pub symbol: String,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
    pub n_trades: i64,
    pub source: String,
}
