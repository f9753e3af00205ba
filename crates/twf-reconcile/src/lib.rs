//! twf-reconcile
//!
//! Read-only audits over the state store. The reconciler never mutates
//! trading state: it verifies the invariants the OMS is supposed to
//! maintain and records the result as a health check for the daily
//! report.
//!
//! Checks, first failure wins:
//!
//! - orphan fills (fill without an owning order)   -> `RECON_ORPHAN_FILLS`
//! - FILLED orders with zero fills                 -> `RECON_FILLED_WITHOUT_FILLS`
//! - FILLED orders whose fills do not sum to qty   -> `RECON_FILL_QTY_MISMATCH`
//! - closed trades missing exit/pnl/close fields   -> `RECON_TRADE_INCOMPLETE`
//! - positions with side/qty inconsistency         -> `RECON_POSITION_INVALID`

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::info;

use twf_store::{clock, insert_health_check, reject_counts_for_day, NewHealthCheck, StoreError};

const QTY_EPS: f64 = 1e-9;

/// Health-check kind tag for reconcile passes.
pub const HEALTH_KIND_RECONCILE: &str = "reconcile";

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub ok: bool,
    pub code: String,
    pub reason: String,
    pub details: Value,
}

impl ReconcileReport {
    fn ok_with(details: Value) -> Self {
        Self {
            ok: true,
            code: "OK".to_string(),
            reason: "state store consistent".to_string(),
            details,
        }
    }

    fn fail(code: &str, reason: impl Into<String>, details: Value) -> Self {
        Self {
            ok: false,
            code: code.to_string(),
            reason: reason.into(),
            details,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Run every reconcile check against a consistent snapshot.
pub async fn reconcile_store(pool: &SqlitePool) -> Result<ReconcileReport> {
    let counts = table_counts(pool).await?;

    // 1) Orphan fills.
    let (orphan_fills,): (i64,) = sqlx::query_as(
        r#"
        select count(1)
        from fills f
        left join orders o on f.broker_order_id = o.broker_order_id
        where o.broker_order_id is null
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(StoreError::unavailable("reconcile orphan fills"))?;
    if orphan_fills > 0 {
        return Ok(ReconcileReport::fail(
            "RECON_ORPHAN_FILLS",
            "fills reference orders that do not exist",
            json!({ "orphan_fills": orphan_fills, "counts": counts }),
        ));
    }

    // 2) FILLED orders must have at least one fill.
    let (filled_without_fills,): (i64,) = sqlx::query_as(
        r#"
        select count(1)
        from orders o
        where o.status = 'FILLED'
          and not exists (select 1 from fills f where f.broker_order_id = o.broker_order_id)
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(StoreError::unavailable("reconcile filled-without-fills"))?;
    if filled_without_fills > 0 {
        return Ok(ReconcileReport::fail(
            "RECON_FILLED_WITHOUT_FILLS",
            "FILLED orders with zero fills",
            json!({ "filled_orders_with_zero_fills": filled_without_fills, "counts": counts }),
        ));
    }

    // 3) For every FILLED order, fill quantities must sum to the order
    //    quantity.
    let mismatches: Vec<(String, f64, Option<f64>)> = sqlx::query_as(
        r#"
        select o.broker_order_id, o.qty, sum(f.qty) as filled
        from orders o
        join fills f on f.broker_order_id = o.broker_order_id
        where o.status = 'FILLED'
        group by o.broker_order_id, o.qty
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(StoreError::unavailable("reconcile fill qty sums"))?;
    let bad: Vec<&(String, f64, Option<f64>)> = mismatches
        .iter()
        .filter(|(_, qty, filled)| (filled.unwrap_or(0.0) - qty).abs() > QTY_EPS)
        .collect();
    if !bad.is_empty() {
        let sample: Vec<Value> = bad
            .iter()
            .take(10)
            .map(|(id, qty, filled)| json!({ "broker_order_id": id, "qty": qty, "filled": filled }))
            .collect();
        return Ok(ReconcileReport::fail(
            "RECON_FILL_QTY_MISMATCH",
            "FILLED orders whose fills do not sum to the order qty",
            json!({ "mismatched": bad.len(), "sample": sample, "counts": counts }),
        ));
    }

    // 4) Closed trades are complete: exit, pnl, pnl_fraction all present.
    let (incomplete_trades,): (i64,) = sqlx::query_as(
        r#"
        select count(1)
        from trades
        where close_ts is not null
          and (exit is null or pnl is null or pnl_fraction is null)
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(StoreError::unavailable("reconcile closed trades"))?;
    if incomplete_trades > 0 {
        return Ok(ReconcileReport::fail(
            "RECON_TRADE_INCOMPLETE",
            "closed trades missing exit/pnl fields",
            json!({ "incomplete_trades": incomplete_trades, "counts": counts }),
        ));
    }

    // 5) Position sanity: qty >= 0, and side is null exactly when flat.
    let (bad_positions,): (i64,) = sqlx::query_as(
        r#"
        select count(1)
        from positions
        where qty < 0
           or (qty = 0 and side is not null)
           or (qty > 0 and side is null)
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(StoreError::unavailable("reconcile positions"))?;
    if bad_positions > 0 {
        return Ok(ReconcileReport::fail(
            "RECON_POSITION_INVALID",
            "positions with side/qty inconsistency",
            json!({ "bad_positions": bad_positions, "counts": counts }),
        ));
    }

    Ok(ReconcileReport::ok_with(json!({ "counts": counts })))
}

async fn table_counts(pool: &SqlitePool) -> Result<Value, StoreError> {
    let mut counts = serde_json::Map::new();
    for table in ["orders", "fills", "trades", "positions"] {
        let (n,): (i64,) = sqlx::query_as(&format!("select count(1) from {table}"))
            .fetch_one(pool)
            .await
            .map_err(StoreError::unavailable("reconcile table counts"))?;
        counts.insert(table.to_string(), json!(n));
    }
    Ok(Value::Object(counts))
}

// ---------------------------------------------------------------------------
// Health recording / reject stats
// ---------------------------------------------------------------------------

/// Persist a reconcile pass as a health-check row.
pub async fn record_reconcile_health(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    report: &ReconcileReport,
) -> Result<i64> {
    let id = insert_health_check(
        pool,
        &NewHealthCheck {
            ts: clock::now_iso(now),
            name: "reconcile_store".to_string(),
            kind: HEALTH_KIND_RECONCILE.to_string(),
            status: if report.ok { "OK" } else { "FAIL" }.to_string(),
            summary: json!({
                "code": report.code,
                "reason": report.reason,
                "details": report.details,
            }),
        },
    )
    .await?;
    info!(code = %report.code, ok = report.ok, "reconcile health recorded");
    Ok(id)
}

/// REJECTED counts by verdict code for one Taipei trading day.
pub async fn reject_stats_for_day(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Value> {
    let day = clock::taipei_day(now);
    let counts = reject_counts_for_day(pool, &day).await?;
    let total: i64 = counts.iter().map(|(_, n)| n).sum();
    let by_code: Vec<Value> = counts
        .into_iter()
        .map(|(code, n)| json!({ "code": code, "count": n }))
        .collect();
    Ok(json!({ "day": day, "total_rejects": total, "by_code": by_code }))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
