//! 1-minute bar builder.
//!
//! Aggregates tick events into `bars_1m` keyed by (minute, asset-class,
//! symbol). Rebuilds are idempotent: the upsert overwrites the same key
//! with the same aggregate, so re-running over the same event range yields
//! the same table.

use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use twf_schemas::events::{ASSET_CLASS_FOP, ASSET_CLASS_STK, KIND_TICK_FOP};
use twf_schemas::Bar;
use twf_store::{clock, list_events_by_kinds, StoreError};

/// Equity-tick kind accepted alongside `tick_fop_v1` so a mixed log builds
/// both asset classes in one pass.
pub const KIND_TICK_STK: &str = "tick_stk_v1";

const SOURCE_TAG: &str = "bar_builder_1m";

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Parser faults are counted and skipped, never fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarBuildReport {
    pub tick_rows: usize,
    pub bars_upserted: usize,
    pub skipped: usize,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

struct Agg {
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    n: i64,
}

/// Build (or rebuild) 1-minute bars from every tick event in the log.
pub async fn build_bars_1m(pool: &SqlitePool) -> Result<BarBuildReport> {
    let rows = list_events_by_kinds(pool, &[KIND_TICK_FOP, KIND_TICK_STK]).await?;

    let mut report = BarBuildReport {
        tick_rows: rows.len(),
        ..Default::default()
    };

    // (ts_min, asset_class, symbol) -> aggregate. BTreeMap keeps upsert
    // order deterministic.
    let mut agg: BTreeMap<(String, String, String), Agg> = BTreeMap::new();

    for ev in rows {
        let payload = &ev.payload;

        let Some(symbol) = payload.get("code").and_then(|c| c.as_str()) else {
            report.skipped += 1;
            continue;
        };
        let Some(px) = extract_price(payload) else {
            report.skipped += 1;
            continue;
        };
        let sz = extract_size(payload).unwrap_or(0.0);

        // Prefer the payload's exchange timestamp over the outer event ts.
        let ts_src = payload
            .get("datetime")
            .and_then(|d| d.as_str())
            .unwrap_or(&ev.ts);
        let Some(ts_min) = floor_minute(ts_src) else {
            report.skipped += 1;
            continue;
        };

        let asset = classify_asset(&ev.kind);
        let key = (ts_min, asset.to_string(), symbol.to_string());
        match agg.get_mut(&key) {
            None => {
                agg.insert(
                    key,
                    Agg {
                        o: px,
                        h: px,
                        l: px,
                        c: px,
                        v: sz,
                        n: 1,
                    },
                );
            }
            Some(st) => {
                st.h = st.h.max(px);
                st.l = st.l.min(px);
                st.c = px;
                st.v += sz;
                st.n += 1;
            }
        }
    }

    let mut tx = pool
        .begin()
        .await
        .map_err(StoreError::tx_failed("bar batch begin"))?;
    for ((ts_min, asset_class, symbol), st) in &agg {
        let bar = Bar {
            ts_min: ts_min.clone(),
            asset_class: asset_class.clone(),
            symbol: symbol.clone(),
            o: st.o,
            h: st.h,
            l: st.l,
            c: st.c,
            v: st.v,
            n_trades: st.n,
            source: SOURCE_TAG.to_string(),
        };
        upsert_bar(&mut *tx, &bar).await?;
        report.bars_upserted += 1;
    }
    tx.commit()
        .await
        .map_err(StoreError::tx_failed("bar batch commit"))?;

    debug!(
        tick_rows = report.tick_rows,
        bars = report.bars_upserted,
        skipped = report.skipped,
        "bar build pass complete"
    );
    Ok(report)
}

fn classify_asset(kind: &str) -> &'static str {
    let k = kind.to_ascii_lowercase();
    if k.contains("stk") {
        ASSET_CLASS_STK
    } else {
        ASSET_CLASS_FOP
    }
}

/// Ticks arrive from more than one recorder generation; probe the common
/// field spellings rather than requiring one schema.
fn extract_price(payload: &Value) -> Option<f64> {
    for key in ["close", "price", "last_price", "last", "trade_price"] {
        if let Some(v) = payload.get(key).and_then(|v| v.as_f64()) {
            return Some(v);
        }
    }
    None
}

fn extract_size(payload: &Value) -> Option<f64> {
    for key in ["volume", "qty", "size", "trade_volume", "last_size"] {
        if let Some(v) = payload.get(key).and_then(|v| v.as_f64()) {
            return Some(v);
        }
    }
    None
}

/// Floor a timestamp to its Taipei minute, keeping the offset so the key
/// stays unambiguous: `2026-01-29T12:10:00+08:00`.
pub fn floor_minute(ts: &str) -> Option<String> {
    let dt = clock::parse_ts_flexible(ts)?;
    let local = dt.with_timezone(&chrono_tz::Asia::Taipei);
    Some(local.format("%Y-%m-%dT%H:%M:00%:z").to_string())
}

// ---------------------------------------------------------------------------
// Table access
// ---------------------------------------------------------------------------

pub async fn upsert_bar<'e, E>(ex: E, bar: &Bar) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        insert into bars_1m (ts_min, asset_class, symbol, o, h, l, c, v, n_trades, source)
        values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        on conflict(ts_min, asset_class, symbol) do update set
            o = excluded.o,
            h = excluded.h,
            l = excluded.l,
            c = excluded.c,
            v = excluded.v,
            n_trades = excluded.n_trades,
            source = excluded.source
        "#,
    )
    .bind(&bar.ts_min)
    .bind(&bar.asset_class)
    .bind(&bar.symbol)
    .bind(bar.o)
    .bind(bar.h)
    .bind(bar.l)
    .bind(bar.c)
    .bind(bar.v)
    .bind(bar.n_trades)
    .bind(&bar.source)
    .execute(ex)
    .await
    .map_err(StoreError::unavailable("upsert_bar"))?;
    Ok(())
}

/// Newest bars first for (asset_class, symbol).
pub async fn fetch_recent_bars(
    pool: &SqlitePool,
    asset_class: &str,
    symbol: &str,
    limit: i64,
) -> Result<Vec<Bar>, StoreError> {
    let rows = sqlx::query(
        r#"
        select ts_min, asset_class, symbol, o, h, l, c, v, n_trades, source
        from bars_1m
        where asset_class = ?1 and symbol = ?2
        order by ts_min desc
        limit ?3
        "#,
    )
    .bind(asset_class)
    .bind(symbol)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(StoreError::unavailable("fetch_recent_bars"))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(Bar {
            ts_min: row
                .try_get("ts_min")
                .map_err(StoreError::unavailable("bars.ts_min"))?,
            asset_class: row
                .try_get("asset_class")
                .map_err(StoreError::unavailable("bars.asset_class"))?,
            symbol: row
                .try_get("symbol")
                .map_err(StoreError::unavailable("bars.symbol"))?,
            o: row.try_get("o").map_err(StoreError::unavailable("bars.o"))?,
            h: row.try_get("h").map_err(StoreError::unavailable("bars.h"))?,
            l: row.try_get("l").map_err(StoreError::unavailable("bars.l"))?,
            c: row.try_get("c").map_err(StoreError::unavailable("bars.c"))?,
            v: row.try_get("v").map_err(StoreError::unavailable("bars.v"))?,
            n_trades: row
                .try_get("n_trades")
                .map_err(StoreError::unavailable("bars.n_trades"))?,
            source: row
                .try_get("source")
                .map_err(StoreError::unavailable("bars.source"))?,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use twf_store::{append_event, testkit_memory_pool, NewEvent};

    fn tick(ts: &str, code: &str, price: f64, qty: f64) -> NewEvent {
        NewEvent {
            ts: ts.into(),
            kind: KIND_TICK_FOP.into(),
            payload: json!({"code": code, "price": price, "qty": qty, "is_buy": true}),
            producer: "recorder".into(),
            ingest_ts: ts.into(),
        }
    }

    #[tokio::test]
    async fn aggregates_one_minute() {
        let pool = testkit_memory_pool().await.unwrap();
        append_event(&pool, &tick("2026-01-29T10:00:01+08:00", "TMFB6", 100.0, 1.0))
            .await
            .unwrap();
        append_event(&pool, &tick("2026-01-29T10:00:30+08:00", "TMFB6", 103.0, 2.0))
            .await
            .unwrap();
        append_event(&pool, &tick("2026-01-29T10:00:59+08:00", "TMFB6", 99.0, 1.0))
            .await
            .unwrap();

        let report = build_bars_1m(&pool).await.unwrap();
        assert_eq!(report.tick_rows, 3);
        assert_eq!(report.bars_upserted, 1);
        assert_eq!(report.skipped, 0);

        let bars = fetch_recent_bars(&pool, "FOP", "TMFB6", 10).await.unwrap();
        assert_eq!(bars.len(), 1);
        let b = &bars[0];
        assert_eq!((b.o, b.h, b.l, b.c), (100.0, 103.0, 99.0, 99.0));
        assert_eq!(b.v, 4.0);
        assert_eq!(b.n_trades, 3);
        assert_eq!(b.ts_min, "2026-01-29T10:00:00+08:00");
    }

    #[tokio::test]
    async fn rebuild_is_idempotent() {
        let pool = testkit_memory_pool().await.unwrap();
        append_event(&pool, &tick("2026-01-29T10:00:01+08:00", "TMFB6", 100.0, 1.0))
            .await
            .unwrap();

        build_bars_1m(&pool).await.unwrap();
        let first = fetch_recent_bars(&pool, "FOP", "TMFB6", 10).await.unwrap();
        build_bars_1m(&pool).await.unwrap();
        let second = fetch_recent_bars(&pool, "FOP", "TMFB6", 10).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn bad_payloads_are_counted_not_fatal() {
        let pool = testkit_memory_pool().await.unwrap();
        append_event(&pool, &tick("2026-01-29T10:00:01+08:00", "TMFB6", 100.0, 1.0))
            .await
            .unwrap();
        append_event(
            &pool,
            &NewEvent {
                ts: "2026-01-29T10:00:02+08:00".into(),
                kind: KIND_TICK_FOP.into(),
                payload: json!({"code": "TMFB6"}), // no price
                producer: "recorder".into(),
                ingest_ts: "2026-01-29T10:00:02+08:00".into(),
            },
        )
        .await
        .unwrap();

        let report = build_bars_1m(&pool).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.bars_upserted, 1);
    }

    #[test]
    fn floor_minute_zeroes_seconds() {
        assert_eq!(
            floor_minute("2026-01-29T12:10:41.139+08:00").unwrap(),
            "2026-01-29T12:10:00+08:00"
        );
        assert!(floor_minute("garbage").is_none());
    }
}
