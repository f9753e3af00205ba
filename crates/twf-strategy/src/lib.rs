//! twf-strategy
//!
//! Strategy contract over 1-minute bars. Strategies are pure decision
//! logic: they see bars, emit signals, and never touch the store or the
//! gateway. Orchestration (feeding bars in, turning signals into intents,
//! placing them) lives with the runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use twf_schemas::{Bar, OrderIntent, OrderType, Side};

pub mod mean_reversion;
pub mod trend;

pub use mean_reversion::{MeanReversionConfig, MeanReversionStrategy};
pub use trend::{TrendConfig, TrendStrategy};

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// A strategy's request to open or flip, with attribution for the audit
/// envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrategySignal {
    pub side: Side,
    pub qty: f64,
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    /// Strategies should provide a stop whenever they can; the risk gate
    /// may require one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    pub reason: String,
    /// 0..1.
    pub confidence: f64,
    #[serde(default)]
    pub features: Map<String, Value>,
    #[serde(default)]
    pub tags: Map<String, Value>,
}

impl StrategySignal {
    /// Order meta carrying the signal's stop, reference price and
    /// attribution block.
    pub fn to_order_meta(
        &self,
        strat_name: &str,
        strat_version: &str,
        ref_price: Option<f64>,
    ) -> Value {
        let mut meta = Map::new();
        if let Some(rp) = ref_price {
            meta.insert("ref_price".to_string(), json!(rp));
        }
        if let Some(stop) = self.stop_price {
            meta.insert("stop_price".to_string(), json!(stop));
        }
        meta.insert("strategy_id".to_string(), json!(format!("{strat_name}@{strat_version}")));
        meta.insert(
            "strat".to_string(),
            json!({
                "name": strat_name,
                "version": strat_version,
                "reason": self.reason,
                "confidence": self.confidence,
                "features": self.features,
                "tags": self.tags,
            }),
        );
        Value::Object(meta)
    }

    /// Build the order intent the runner hands to the gateway.
    pub fn into_intent(
        self,
        symbol: &str,
        strat_name: &str,
        strat_version: &str,
        ref_price: Option<f64>,
    ) -> OrderIntent {
        let meta = self.to_order_meta(strat_name, strat_version, ref_price);
        OrderIntent {
            symbol: symbol.to_string(),
            side: self.side,
            qty: self.qty,
            order_type: self.order_type.as_str().to_string(),
            price: self.price,
            meta,
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy contract
// ---------------------------------------------------------------------------

/// Context handed to strategies on every bar.
#[derive(Clone, Debug)]
pub struct StrategyContext {
    pub now: DateTime<Utc>,
    pub symbol: String,
}

/// A strategy over 1-minute bars. Return a signal to open/flip; `None`
/// otherwise.
pub trait Strategy {
    fn name(&self) -> &'static str;
    fn version(&self) -> &'static str;
    fn on_bar_1m(&mut self, ctx: &StrategyContext, bar: &Bar) -> Option<StrategySignal>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal() -> StrategySignal {
        StrategySignal {
            side: Side::Buy,
            qty: 2.0,
            order_type: OrderType::Market,
            price: None,
            stop_price: Some(19950.0),
            reason: "breakout_up".into(),
            confidence: 0.53,
            features: Map::new(),
            tags: Map::new(),
        }
    }

    #[test]
    fn order_meta_carries_stop_and_attribution() {
        let meta = signal().to_order_meta("trend", "v1", Some(20000.0));
        assert_eq!(meta["ref_price"], 20000.0);
        assert_eq!(meta["stop_price"], 19950.0);
        assert_eq!(meta["strategy_id"], "trend@v1");
        assert_eq!(meta["strat"]["reason"], "breakout_up");
    }

    #[test]
    fn intent_inherits_signal_shape() {
        let intent = signal().into_intent("TMFB6", "trend", "v1", Some(20000.0));
        assert_eq!(intent.symbol, "TMFB6");
        assert_eq!(intent.side, Side::Buy);
        assert_eq!(intent.qty, 2.0);
        assert_eq!(intent.order_type, "MARKET");
        assert_eq!(intent.meta["stop_price"], 19950.0);
    }
}
