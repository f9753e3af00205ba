//! Mean-reversion skeleton: fade moves away from the previous bar close.

use serde_json::json;

use twf_schemas::{Bar, OrderType, Side};

use crate::{Strategy, StrategyContext, StrategySignal};

#[derive(Clone, Debug, PartialEq)]
pub struct MeanReversionConfig {
    pub qty: f64,
    /// Distance from the previous close, in points, that arms an entry.
    pub entry_points: f64,
    /// Protective stop distance, in points.
    pub stop_points: f64,
}

impl Default for MeanReversionConfig {
    fn default() -> Self {
        Self {
            qty: 2.0,
            entry_points: 10.0,
            stop_points: 50.0,
        }
    }
}

pub struct MeanReversionStrategy {
    cfg: MeanReversionConfig,
    last_close: Option<f64>,
}

impl MeanReversionStrategy {
    pub fn new(cfg: MeanReversionConfig) -> Self {
        Self {
            cfg,
            last_close: None,
        }
    }
}

impl Strategy for MeanReversionStrategy {
    fn name(&self) -> &'static str {
        "mean_reversion"
    }

    fn version(&self) -> &'static str {
        "v1"
    }

    fn on_bar_1m(&mut self, _ctx: &StrategyContext, bar: &Bar) -> Option<StrategySignal> {
        let c = bar.c;

        let Some(last) = self.last_close else {
            self.last_close = Some(c);
            return None;
        };

        // Drop far enough: buy the bounce. Pop far enough: sell the
        // pullback.
        let (side, stop_price, reason) = if c <= last - self.cfg.entry_points {
            (Side::Buy, c - self.cfg.stop_points, "mr: fade_drop")
        } else if c >= last + self.cfg.entry_points {
            (Side::Sell, c + self.cfg.stop_points, "mr: fade_pop")
        } else {
            self.last_close = Some(c);
            return None;
        };

        self.last_close = Some(c);

        let mut features = serde_json::Map::new();
        features.insert("c".to_string(), json!(c));
        features.insert("last_close".to_string(), json!(last));
        features.insert("entry_points".to_string(), json!(self.cfg.entry_points));
        features.insert("stop_points".to_string(), json!(self.cfg.stop_points));

        let mut tags = serde_json::Map::new();
        tags.insert("kind".to_string(), json!("mean_reversion"));

        Some(StrategySignal {
            side,
            qty: self.cfg.qty,
            order_type: OrderType::Market,
            price: None,
            stop_price: Some(stop_price),
            reason: reason.to_string(),
            confidence: 0.52,
            features,
            tags,
        })
    }
}
