//! Trade intents and their audit envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Side;

// ---------------------------------------------------------------------------
// Stop / intent envelope
// ---------------------------------------------------------------------------

/// Protective stop attached to an intent.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StopSpec {
    pub stop_price: f64,
}

/// Provenance envelope stamped into `meta.intent` by the gateway.
///
/// The `(correlation_id, causation_id, envelope)` tuple is the fingerprint
/// that identifies one intent across orders, fills and verdict rows. The
/// gateway generates `correlation_id` when the caller did not supply one
/// and never mutates any other caller field.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentEnvelope {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSpec>,
}

// ---------------------------------------------------------------------------
// OrderIntent
// ---------------------------------------------------------------------------

/// A caller's request to trade, before any gate has seen it.
///
/// `qty` and `order_type` are deliberately raw (float quantity, free-form
/// type string): validating them is the exchange preflight's job, and the
/// verdict for a malformed intent must be persisted like any other reject.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub order_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    /// Free-form caller meta (ref_price, stop_price, market_metrics,
    /// session_hint, overrides...). The gateway only ever adds keys.
    #[serde(default)]
    pub meta: Value,
}

impl OrderIntent {
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        qty: f64,
        order_type: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            qty,
            order_type: order_type.into(),
            price: None,
            meta: Value::Null,
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }

    /// Meta as an object map; `Null` meta reads as empty.
    pub fn meta_object(&self) -> serde_json::Map<String, Value> {
        match &self.meta {
            Value::Object(m) => m.clone(),
            _ => serde_json::Map::new(),
        }
    }

    /// Fetch an `f64` out of meta, tolerating JSON numbers and numeric
    /// strings (callers feed these envelopes from many sources).
    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        meta_f64(&self.meta, key)
    }

    /// Truthy meta flag: `true`, nonzero number, or `"1"/"true"/"yes"/"on"`.
    pub fn meta_truthy(&self, key: &str) -> bool {
        meta_truthy(&self.meta, key)
    }
}

/// `meta[key]` as f64, accepting numbers or numeric strings.
pub fn meta_f64(meta: &Value, key: &str) -> Option<f64> {
    match meta.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Truthy test for loosely-typed meta flags.
pub fn meta_truthy(meta: &Value, key: &str) -> bool {
    match meta.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|x| x != 0.0).unwrap_or(false),
        Some(Value::String(s)) => {
            matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "t" | "yes" | "y" | "on"
            )
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn meta_f64_accepts_numbers_and_strings() {
        let intent = OrderIntent::new("TMF", Side::Buy, 2.0, "MARKET")
            .with_meta(json!({"ref_price": 20000.0, "stop_price": "19900"}));
        assert_eq!(intent.meta_f64("ref_price"), Some(20000.0));
        assert_eq!(intent.meta_f64("stop_price"), Some(19900.0));
        assert_eq!(intent.meta_f64("absent"), None);
    }

    #[test]
    fn meta_truthy_accepts_common_spellings() {
        let intent = OrderIntent::new("TMF", Side::Buy, 1.0, "MARKET").with_meta(json!({
            "reduce_only": "yes",
            "sim_mode": 1,
            "paper_mode": false,
        }));
        assert!(intent.meta_truthy("reduce_only"));
        assert!(intent.meta_truthy("sim_mode"));
        assert!(!intent.meta_truthy("paper_mode"));
        assert!(!intent.meta_truthy("missing"));
    }

    #[test]
    fn null_meta_reads_as_empty_object() {
        let intent = OrderIntent::new("TMF", Side::Sell, 1.0, "LIMIT").with_price(20010.0);
        assert!(intent.meta_object().is_empty());
        assert!(!intent.meta_truthy("anything"));
    }

    #[test]
    fn envelope_skips_absent_fields_on_wire() {
        let env = IntentEnvelope {
            correlation_id: "c-1".into(),
            ..Default::default()
        };
        let j = serde_json::to_value(&env).unwrap();
        assert_eq!(j["correlation_id"], "c-1");
        assert!(j.get("causation_id").is_none());
        assert!(j.get("stop").is_none());
    }
}
