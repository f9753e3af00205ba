//! twf-market
//!
//! Market-data plumbing around the event log: the metrics reader used by
//! the risk gate, the 1-minute bar builder, the total event ordering used
//! by replay, and the bounded-queue recorder that feeds the log.

pub mod bars;
pub mod metrics;
pub mod ordering;
pub mod recorder;

pub use bars::{build_bars_1m, fetch_recent_bars, upsert_bar, BarBuildReport};
pub use metrics::{read_market_metrics, MarketMetrics, MetricsSource, SEED_PRODUCER_PREFIX};
pub use ordering::{order_events, ReplayEvent, ReplayReport};
pub use recorder::{Recorder, RecorderConfig, RecorderQueue};
