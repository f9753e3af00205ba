//! Market metrics snapshot for a symbol at an as-of time.
//!
//! Derived strictly from what the event log and bar table already contain.
//! Missing bid or ask yields `None`: the reader never fabricates a value,
//! and the risk gate decides what absence means.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;

use twf_schemas::events::KIND_BIDASK_FOP;
use twf_schemas::BookPayload;
use twf_store::{latest_event_by_kind, DEFAULT_SCAN_LIMIT};

use crate::bars::fetch_recent_bars;

/// Producer prefix used by injected test seeds. The metrics reader skips
/// these rows so smoke fixtures cannot leak into live decisions.
pub const SEED_PRODUCER_PREFIX: &str = "seed_";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Where the snapshot came from, for the audit envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsSource {
    pub event_id: i64,
    pub event_ts: String,
    pub fop_code: String,
    pub atr_symbol: String,
    pub atr_n: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketMetrics {
    pub bid: f64,
    pub ask: f64,
    /// `ask - bid` from level-1 prices, in points.
    pub spread_points: f64,
    /// ATR in points over the last `atr_n` one-minute bars; `None` when
    /// there is not enough bar history.
    pub atr_points: Option<f64>,
    /// Scale-free proxy: sum of the first five bid and ask level volumes.
    pub liquidity_score: f64,
    pub source: MetricsSource,
}

impl MarketMetrics {
    /// Shape embedded into order meta as `meta.market_metrics`.
    pub fn to_meta(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Latest book-derived metrics for `fop_code`.
///
/// Selects the newest non-synthetic, non-seed `bidask_fop_v1` event for
/// the code; returns `Ok(None)` when no such event exists or level-1 bid
/// or ask is missing.
pub async fn read_market_metrics(
    pool: &SqlitePool,
    fop_code: &str,
    bars_symbol_for_atr: Option<&str>,
    atr_n: i64,
) -> Result<Option<MarketMetrics>> {
    let ev = latest_event_by_kind(pool, KIND_BIDASK_FOP, DEFAULT_SCAN_LIMIT, |e| {
        if e.producer.starts_with(SEED_PRODUCER_PREFIX) {
            return false;
        }
        e.payload.get("code").and_then(|c| c.as_str()) == Some(fop_code)
            && e.payload.get("synthetic").and_then(|s| s.as_bool()) != Some(true)
    })
    .await?;

    let Some(ev) = ev else { return Ok(None) };

    let book: BookPayload = match serde_json::from_value(ev.payload.clone()) {
        Ok(b) => b,
        Err(_) => return Ok(None),
    };

    let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) else {
        return Ok(None);
    };

    let liquidity_score = top5_volume_sum(&book.bid_volume) + top5_volume_sum(&book.ask_volume);

    let atr_symbol = bars_symbol_for_atr.unwrap_or(fop_code);
    let atr_points = atr_from_bars_1m(pool, "FOP", atr_symbol, atr_n).await?;

    Ok(Some(MarketMetrics {
        bid,
        ask,
        spread_points: ask - bid,
        atr_points,
        liquidity_score,
        source: MetricsSource {
            event_id: ev.id,
            event_ts: ev.ts,
            fop_code: fop_code.to_string(),
            atr_symbol: atr_symbol.to_string(),
            atr_n,
        },
    }))
}

fn top5_volume_sum(vols: &[f64]) -> f64 {
    vols.iter().take(5).sum()
}

/// ATR in points from the bar table.
///
/// Classic True Range over the last `n` intervals (needs `n + 1` bars for
/// the previous close), averaged with a simple mean. Returns `None` with
/// fewer than two bars.
pub async fn atr_from_bars_1m(
    pool: &SqlitePool,
    asset_class: &str,
    symbol: &str,
    n: i64,
) -> Result<Option<f64>> {
    let bars = fetch_recent_bars(pool, asset_class, symbol, n + 1).await?;
    if bars.len() < 2 {
        return Ok(None);
    }

    // fetch_recent_bars returns newest-first; walk chronologically.
    let chron: Vec<_> = bars.into_iter().rev().collect();

    let mut trs = Vec::with_capacity(chron.len().saturating_sub(1));
    let mut prev_close = chron[0].c;
    for bar in &chron[1..] {
        let tr = (bar.h - bar.l)
            .max((bar.h - prev_close).abs())
            .max((bar.l - prev_close).abs());
        trs.push(tr);
        prev_close = bar.c;
    }

    if trs.is_empty() {
        return Ok(None);
    }
    let take = trs.len().min(n.max(1) as usize);
    let tail = &trs[trs.len() - take..];
    Ok(Some(tail.iter().sum::<f64>() / tail.len() as f64))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use twf_schemas::Bar;
    use twf_store::{append_event, testkit_memory_pool, NewEvent};

    fn book_event(code: &str, synthetic: bool, producer: &str) -> NewEvent {
        NewEvent {
            ts: "2026-01-29T10:00:00+08:00".into(),
            kind: KIND_BIDASK_FOP.into(),
            payload: json!({
                "code": code,
                "bid_price": [20000.0, 19999.0],
                "ask_price": [20001.0, 20002.0],
                "bid_volume": [3.0, 2.0, 1.0, 1.0, 1.0, 99.0],
                "ask_volume": [4.0, 2.0, 1.0, 1.0, 1.0, 99.0],
                "synthetic": synthetic,
            }),
            producer: producer.into(),
            ingest_ts: "2026-01-29T10:00:00+08:00".into(),
        }
    }

    #[tokio::test]
    async fn metrics_from_latest_real_book() {
        let pool = testkit_memory_pool().await.unwrap();
        append_event(&pool, &book_event("TMFB6", false, "recorder"))
            .await
            .unwrap();

        let mm = read_market_metrics(&pool, "TMFB6", None, 20)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mm.bid, 20000.0);
        assert_eq!(mm.ask, 20001.0);
        assert_eq!(mm.spread_points, 1.0);
        // Top-5 only: the sixth level (99.0) is ignored.
        assert_eq!(mm.liquidity_score, 8.0 + 9.0);
        assert_eq!(mm.atr_points, None);
    }

    #[tokio::test]
    async fn synthetic_and_seed_rows_are_skipped() {
        let pool = testkit_memory_pool().await.unwrap();
        append_event(&pool, &book_event("TMFB6", false, "recorder"))
            .await
            .unwrap();
        append_event(&pool, &book_event("TMFB6", true, "recorder"))
            .await
            .unwrap();
        append_event(&pool, &book_event("TMFB6", false, "seed_ops"))
            .await
            .unwrap();

        let mm = read_market_metrics(&pool, "TMFB6", None, 20)
            .await
            .unwrap()
            .unwrap();
        // Only the first event qualifies.
        assert_eq!(mm.source.event_id, 1);
    }

    #[tokio::test]
    async fn missing_ask_returns_none() {
        let pool = testkit_memory_pool().await.unwrap();
        append_event(
            &pool,
            &NewEvent {
                ts: "2026-01-29T10:00:00+08:00".into(),
                kind: KIND_BIDASK_FOP.into(),
                payload: json!({"code": "TMFB6", "bid_price": [20000.0], "ask_price": []}),
                producer: "recorder".into(),
                ingest_ts: "2026-01-29T10:00:00+08:00".into(),
            },
        )
        .await
        .unwrap();

        assert!(read_market_metrics(&pool, "TMFB6", None, 20)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn atr_uses_true_range_mean() {
        let pool = testkit_memory_pool().await.unwrap();
        // Three bars: closes 100 -> 110 -> 105.
        let bars = [
            ("2026-01-29T10:00:00+08:00", 100.0, 102.0, 99.0, 100.0),
            ("2026-01-29T10:01:00+08:00", 100.0, 112.0, 100.0, 110.0),
            ("2026-01-29T10:02:00+08:00", 110.0, 111.0, 104.0, 105.0),
        ];
        for (ts, o, h, l, c) in bars {
            upsert(&pool, ts, o, h, l, c).await;
        }

        // TR2 = max(12, |112-100|, |100-100|) = 12
        // TR3 = max(7, |111-110|, |104-110|) = 7
        let atr = atr_from_bars_1m(&pool, "FOP", "TMFB6", 2).await.unwrap().unwrap();
        assert!((atr - 9.5).abs() < 1e-9);
    }

    async fn upsert(pool: &sqlx::SqlitePool, ts: &str, o: f64, h: f64, l: f64, c: f64) {
        crate::bars::upsert_bar(
            pool,
            &Bar {
                ts_min: ts.into(),
                asset_class: "FOP".into(),
                symbol: "TMFB6".into(),
                o,
                h,
                l,
                c,
                v: 1.0,
                n_trades: 1,
                source: "test".into(),
            },
        )
        .await
        .unwrap();
    }
}
