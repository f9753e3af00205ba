//! TAIFEX exchange preflight.
//!
//! Hard exchange constraints checked before risk: order-size limits by
//! type and session, MWP same-side anchor, dynamic-price-band regime
//! block, and the broker's TIF rule for market-style orders. The verdict
//! for an oversized order carries a split plan; whether to split is the
//! caller's policy decision, not preflight's.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Asia::Taipei;
use serde_json::{json, Value};

use twf_schemas::intent::{meta_f64, meta_truthy};
use twf_schemas::{OrderType, Side, Verdict};

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Per-order size caps differ between the day session and after-hours.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionKind {
    Regular,
    AfterHours,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Regular => "REGULAR",
            SessionKind::AfterHours => "AFTER_HOURS",
        }
    }
}

/// Session for cap selection: explicit meta hint wins, otherwise inferred
/// from the Taipei clock (regular window 08:45-13:45).
pub fn session_hint(meta: &Value, now: DateTime<Utc>) -> SessionKind {
    if let Some(hint) = meta.get("session_hint").and_then(|v| v.as_str()) {
        match hint.trim().to_ascii_uppercase().as_str() {
            "NIGHT" | "AFTER_HOURS" | "AH" => return SessionKind::AfterHours,
            "REGULAR" | "DAY" => return SessionKind::Regular,
            _ => {}
        }
    }
    let t = now.with_timezone(&Taipei).time();
    let open = NaiveTime::from_hms_opt(8, 45, 0).unwrap();
    let close = NaiveTime::from_hms_opt(13, 45, 0).unwrap();
    if t >= open && t <= close {
        SessionKind::Regular
    } else {
        SessionKind::AfterHours
    }
}

/// Market-order per-order caps (contracts): day 10, after-hours 5.
pub fn market_qty_limit(session: SessionKind) -> f64 {
    match session {
        SessionKind::Regular => 10.0,
        SessionKind::AfterHours => 5.0,
    }
}

/// Limit/MWP per-order cap for index futures.
pub const LIMIT_QTY_CAP: f64 = 100.0;

// ---------------------------------------------------------------------------
// Preflight
// ---------------------------------------------------------------------------

/// Run every preflight gate for one intent.
pub fn check_preflight(
    symbol: &str,
    side: Side,
    qty: f64,
    order_type_raw: &str,
    _price: Option<f64>,
    meta: &Value,
    now: DateTime<Utc>,
) -> Verdict {
    // 1) Quantity must be a positive integer number of contracts.
    if !qty.is_finite() || qty <= 0.0 || qty.fract() != 0.0 {
        return Verdict::block(
            "ORDER_QTY_INVALID",
            format!("order qty must be a positive integer, got {qty}"),
            json!({ "qty": qty }),
        );
    }

    // 2) Escape hatch for drills that must reach the next gate.
    if meta_truthy(meta, "allow_preflight_bypass") {
        return Verdict::pass_with(
            "OK_PREFLIGHT_BYPASS",
            "preflight bypassed by meta flag",
            json!({ "symbol": symbol }),
        );
    }

    // 3) Dynamic-price-band regime: block aggressive orders outright.
    if meta_truthy(meta, "regime_dpb_risk") {
        return Verdict::block(
            "EXEC_TAIFEX_REGIME_DPB_RISK",
            "DPB/price-limit regime risk flagged; block or reduce aggressiveness per policy",
            json!({ "regime_dpb_risk": true }),
        );
    }

    let ot = OrderType::normalize(order_type_raw);

    // 4) MWP needs its same-side best-price anchor (exchange definition).
    let is_mwp = ot == Some(OrderType::Mwp) || meta_truthy(meta, "mwp");
    if is_mwp {
        if meta.get("best_same_side_limit").map(|v| v.is_null()).unwrap_or(true) {
            let (suggested, source_key) = suggest_same_side_limit(side, meta);
            let mut details = json!({ "side": side.as_str(), "order_type": "MWP" });
            if let Some(sug) = suggested {
                details["suggested_meta"] = json!({ "best_same_side_limit": sug });
                details["suggested_meta_source"] = json!(source_key);
            }
            details["hint"] = json!(
                "MWP requires best_same_side_limit; provide meta.bid/best_bid (BUY) or meta.ask/best_ask (SELL)."
            );
            return Verdict::block(
                "EXEC_TAIFEX_MWP_NO_SAMESIDE_LIMIT",
                "MWP requires same-side best limit price; missing best_same_side_limit",
                details,
            );
        }
        if meta.get("protection_points").map(|v| v.is_null()).unwrap_or(true) {
            return Verdict::pass_with(
                "OK_TAIFEX_MWP_NO_PROTECTION_POINTS",
                "MWP provided best_same_side_limit but protection_points missing; caller should set per product table",
                json!({ "best_same_side_limit": meta.get("best_same_side_limit") }),
            );
        }
    }

    // Broker rule: market-style orders only accept IOC time-in-force.
    if let Some(tif) = extract_tif(meta) {
        if matches!(ot, Some(OrderType::Market) | Some(OrderType::Mwp)) && tif != "IOC" {
            return Verdict::block(
                "EXEC_TIF_UNSUPPORTED_FOR_MKT_MKP",
                format!("broker requires tif=IOC for market-style orders (got tif={tif})"),
                json!({ "tif": tif, "order_type": order_type_raw }),
            );
        }
    }

    // 5-6) Per-order size caps.
    let session = session_hint(meta, now);
    let (cap, over_code) = match ot {
        Some(OrderType::Market) => (market_qty_limit(session), "EXEC_TAIFEX_MKT_QTY_LIMIT"),
        Some(OrderType::Limit) | Some(OrderType::Mwp) => (LIMIT_QTY_CAP, "TAIFEX_ORDER_SIZE_LIMIT"),
        None => {
            return Verdict::block(
                "ORDER_TYPE_UNSUPPORTED",
                format!("unsupported order type: {order_type_raw}"),
                json!({ "order_type": order_type_raw }),
            );
        }
    };

    if qty <= cap {
        return Verdict::pass_with(
            "OK",
            "taifex preflight pass",
            json!({
                "order_type": ot.map(|t| t.as_str()),
                "session_hint": session.as_str(),
                "limit": cap,
            }),
        );
    }

    Verdict::block(
        over_code,
        format!(
            "order qty {qty} exceeds TAIFEX per-order limit {cap} ({}); must split or reject",
            session.as_str()
        ),
        json!({
            "qty": qty,
            "limit": cap,
            "session_hint": session.as_str(),
            "split_plan": { "child_qty": cap, "chunks": split_chunks(qty, cap) },
        }),
    )
}

/// Full-cap chunks plus remainder: 25 at cap 10 -> [10, 10, 5].
pub fn split_chunks(qty: f64, cap: f64) -> Vec<f64> {
    let mut chunks = Vec::new();
    let mut remaining = qty;
    while remaining > cap {
        chunks.push(cap);
        remaining -= cap;
    }
    if remaining > 0.0 {
        chunks.push(remaining);
    }
    chunks
}

/// Time-in-force under its common meta spellings, uppercased.
fn extract_tif(meta: &Value) -> Option<String> {
    for key in ["tif", "time_in_force", "order_type_tif", "tif_type"] {
        if let Some(v) = meta.get(key).and_then(|v| v.as_str()) {
            let v = v.trim().to_ascii_uppercase();
            if !v.is_empty() {
                return Some(v);
            }
        }
    }
    None
}

/// Suggest the missing MWP anchor from best-of-book values in meta.
/// Same-side: BUY anchors at the best bid, SELL at the best ask.
fn suggest_same_side_limit(side: Side, meta: &Value) -> (Option<f64>, Option<&'static str>) {
    let bid_keys: &[&str] = &["bid", "best_bid", "bid_price", "best_bid_price"];
    let ask_keys: &[&str] = &["ask", "best_ask", "ask_price", "best_offer", "offer"];
    let keys = match side {
        Side::Buy => bid_keys,
        Side::Sell => ask_keys,
    };
    for &k in keys {
        if let Some(v) = meta_f64(meta, k) {
            return (Some(v), Some(k));
        }
    }
    (None, None)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
