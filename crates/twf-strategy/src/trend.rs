//! Trend-following skeleton: breakout continuation against the previous
//! bar close.

use serde_json::json;

use twf_schemas::{Bar, OrderType, Side};

use crate::{Strategy, StrategyContext, StrategySignal};

#[derive(Clone, Debug, PartialEq)]
pub struct TrendConfig {
    pub qty: f64,
    /// Close-to-close move, in points, that counts as a breakout.
    pub threshold_points: f64,
    /// Protective stop distance, in points.
    pub stop_points: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            qty: 2.0,
            threshold_points: 10.0,
            stop_points: 50.0,
        }
    }
}

pub struct TrendStrategy {
    cfg: TrendConfig,
    last_close: Option<f64>,
}

impl TrendStrategy {
    pub fn new(cfg: TrendConfig) -> Self {
        Self {
            cfg,
            last_close: None,
        }
    }
}

impl Strategy for TrendStrategy {
    fn name(&self) -> &'static str {
        "trend"
    }

    fn version(&self) -> &'static str {
        "v1"
    }

    fn on_bar_1m(&mut self, _ctx: &StrategyContext, bar: &Bar) -> Option<StrategySignal> {
        let c = bar.c;

        let Some(last) = self.last_close else {
            // First bar primes the reference close.
            self.last_close = Some(c);
            return None;
        };

        let delta = c - last;
        let (side, stop_price, reason) = if delta >= self.cfg.threshold_points {
            (Side::Buy, c - self.cfg.stop_points, "trend: breakout_up")
        } else if delta <= -self.cfg.threshold_points {
            (Side::Sell, c + self.cfg.stop_points, "trend: breakout_down")
        } else {
            self.last_close = Some(c);
            return None;
        };

        self.last_close = Some(c);

        let mut features = serde_json::Map::new();
        features.insert("c".to_string(), json!(c));
        features.insert("last_close".to_string(), json!(last));
        features.insert("delta".to_string(), json!(delta));
        features.insert("threshold_points".to_string(), json!(self.cfg.threshold_points));
        features.insert("stop_points".to_string(), json!(self.cfg.stop_points));

        let mut tags = serde_json::Map::new();
        tags.insert("kind".to_string(), json!("trend"));

        Some(StrategySignal {
            side,
            qty: self.cfg.qty,
            order_type: OrderType::Market,
            price: None,
            stop_price: Some(stop_price),
            reason: reason.to_string(),
            confidence: 0.53,
            features,
            tags,
        })
    }
}
