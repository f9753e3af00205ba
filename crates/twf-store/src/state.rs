//! Transactional state tables: orders, fills, trades, positions, safety
//! state, health checks.
//!
//! # Atomicity contract
//!
//! All writes implied by a single intent (order + fills + trade + position)
//! MUST go through one transaction; the helpers here are executor-generic
//! for exactly that reason. If the transaction cannot commit the intent
//! fails with `STORE_TX_FAILED` and no partial state is exposed.

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::StoreError;

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub ts: String,
    pub broker_order_id: String,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub price: Option<f64>,
    pub order_type: String,
    pub status: String,
    pub verdict_code: Option<String>,
    pub decision_domain: Option<String>,
    pub decision_action: Option<String>,
    pub meta: Value,
}

#[derive(Debug, Clone)]
pub struct OrderRow {
    pub id: i64,
    pub ts: String,
    pub broker_order_id: String,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub price: Option<f64>,
    pub order_type: String,
    pub status: String,
    pub verdict_code: Option<String>,
    pub decision_domain: Option<String>,
    pub decision_action: Option<String>,
    pub meta: Value,
}

fn meta_to_text(meta: &Value) -> String {
    serde_json::to_string(meta).unwrap_or_else(|_| "{}".to_string())
}

fn meta_from_text(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or(Value::Null)
}

fn order_from_row(row: &SqliteRow) -> Result<OrderRow, StoreError> {
    let meta_json: String = row
        .try_get("meta_json")
        .map_err(StoreError::unavailable("orders.meta_json"))?;
    Ok(OrderRow {
        id: row.try_get("id").map_err(StoreError::unavailable("orders.id"))?,
        ts: row.try_get("ts").map_err(StoreError::unavailable("orders.ts"))?,
        broker_order_id: row
            .try_get("broker_order_id")
            .map_err(StoreError::unavailable("orders.broker_order_id"))?,
        symbol: row
            .try_get("symbol")
            .map_err(StoreError::unavailable("orders.symbol"))?,
        side: row
            .try_get("side")
            .map_err(StoreError::unavailable("orders.side"))?,
        qty: row.try_get("qty").map_err(StoreError::unavailable("orders.qty"))?,
        price: row
            .try_get("price")
            .map_err(StoreError::unavailable("orders.price"))?,
        order_type: row
            .try_get("order_type")
            .map_err(StoreError::unavailable("orders.order_type"))?,
        status: row
            .try_get("status")
            .map_err(StoreError::unavailable("orders.status"))?,
        verdict_code: row
            .try_get("verdict_code")
            .map_err(StoreError::unavailable("orders.verdict_code"))?,
        decision_domain: row
            .try_get("decision_domain")
            .map_err(StoreError::unavailable("orders.decision_domain"))?,
        decision_action: row
            .try_get("decision_action")
            .map_err(StoreError::unavailable("orders.decision_action"))?,
        meta: meta_from_text(&meta_json),
    })
}

/// Insert one order row. `broker_order_id` is unique; a duplicate is a
/// store fault (ids are uuid-derived, collisions mean caller error).
pub async fn insert_order<'e, E>(ex: E, o: &NewOrder) -> Result<i64, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let res = sqlx::query(
        r#"
        insert into orders (
            ts, broker_order_id, symbol, side, qty, price, order_type,
            status, verdict_code, decision_domain, decision_action, meta_json
        ) values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
    )
    .bind(&o.ts)
    .bind(&o.broker_order_id)
    .bind(&o.symbol)
    .bind(&o.side)
    .bind(o.qty)
    .bind(o.price)
    .bind(&o.order_type)
    .bind(&o.status)
    .bind(&o.verdict_code)
    .bind(&o.decision_domain)
    .bind(&o.decision_action)
    .bind(meta_to_text(&o.meta))
    .execute(ex)
    .await
    .map_err(StoreError::unavailable("insert_order"))?;

    Ok(res.last_insert_rowid())
}

/// Rewrite status + meta for an order (OMS fill bookkeeping).
pub async fn update_order_status_meta<'e, E>(
    ex: E,
    broker_order_id: &str,
    status: &str,
    meta: &Value,
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        update orders
           set status = ?2,
               meta_json = ?3
         where broker_order_id = ?1
        "#,
    )
    .bind(broker_order_id)
    .bind(status)
    .bind(meta_to_text(meta))
    .execute(ex)
    .await
    .map_err(StoreError::unavailable("update_order_status_meta"))?;
    Ok(())
}

/// Stamp the gateway decision onto an existing order row.
/// Returns false when no row matched (caller inserts instead).
pub async fn update_order_decision<'e, E>(
    ex: E,
    broker_order_id: &str,
    status: &str,
    verdict_code: &str,
    decision_domain: &str,
    decision_action: &str,
    meta: &Value,
) -> Result<bool, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let res = sqlx::query(
        r#"
        update orders
           set status = ?2,
               verdict_code = ?3,
               decision_domain = ?4,
               decision_action = ?5,
               meta_json = ?6
         where broker_order_id = ?1
        "#,
    )
    .bind(broker_order_id)
    .bind(status)
    .bind(verdict_code)
    .bind(decision_domain)
    .bind(decision_action)
    .bind(meta_to_text(meta))
    .execute(ex)
    .await
    .map_err(StoreError::unavailable("update_order_decision"))?;

    Ok(res.rows_affected() > 0)
}

pub async fn fetch_order<'e, E>(ex: E, broker_order_id: &str) -> Result<Option<OrderRow>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query(
        r#"
        select id, ts, broker_order_id, symbol, side, qty, price, order_type,
               status, verdict_code, decision_domain, decision_action, meta_json
        from orders
        where broker_order_id = ?1
        "#,
    )
    .bind(broker_order_id)
    .fetch_optional(ex)
    .await
    .map_err(StoreError::unavailable("fetch_order"))?;

    row.as_ref().map(order_from_row).transpose()
}

/// Newest orders first, for smoke output and reconciler sweeps.
pub async fn list_recent_orders(pool: &SqlitePool, limit: i64) -> Result<Vec<OrderRow>, StoreError> {
    let rows = sqlx::query(
        r#"
        select id, ts, broker_order_id, symbol, side, qty, price, order_type,
               status, verdict_code, decision_domain, decision_action, meta_json
        from orders
        order by id desc
        limit ?1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(StoreError::unavailable("list_recent_orders"))?;

    rows.iter().map(order_from_row).collect()
}

/// REJECTED counts by verdict code for one trading day (reject stats).
pub async fn reject_counts_for_day(
    pool: &SqlitePool,
    day_prefix: &str,
) -> Result<Vec<(String, i64)>, StoreError> {
    let rows = sqlx::query(
        r#"
        select coalesce(verdict_code, 'UNKNOWN') as code, count(1) as n
        from orders
        where status = 'REJECTED' and ts like ?1 || '%'
        group by coalesce(verdict_code, 'UNKNOWN')
        order by n desc, code asc
        "#,
    )
    .bind(day_prefix)
    .fetch_all(pool)
    .await
    .map_err(StoreError::unavailable("reject_counts_for_day"))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push((
            row.try_get("code")
                .map_err(StoreError::unavailable("reject_counts code col"))?,
            row.try_get("n")
                .map_err(StoreError::unavailable("reject_counts n col"))?,
        ));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Fills
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewFill {
    pub ts: String,
    pub broker_order_id: String,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub price: f64,
    pub fee: f64,
    pub tax: f64,
    pub meta: Value,
}

#[derive(Debug, Clone)]
pub struct FillRow {
    pub id: i64,
    pub ts: String,
    pub broker_order_id: String,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub price: f64,
    pub fee: f64,
    pub tax: f64,
    pub meta: Value,
}

pub async fn insert_fill<'e, E>(ex: E, f: &NewFill) -> Result<i64, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let res = sqlx::query(
        r#"
        insert into fills (ts, broker_order_id, symbol, side, qty, price, fee, tax, meta_json)
        values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&f.ts)
    .bind(&f.broker_order_id)
    .bind(&f.symbol)
    .bind(&f.side)
    .bind(f.qty)
    .bind(f.price)
    .bind(f.fee)
    .bind(f.tax)
    .bind(meta_to_text(&f.meta))
    .execute(ex)
    .await
    .map_err(StoreError::unavailable("insert_fill"))?;

    Ok(res.last_insert_rowid())
}

pub async fn list_fills_for_order(
    pool: &SqlitePool,
    broker_order_id: &str,
) -> Result<Vec<FillRow>, StoreError> {
    let rows = sqlx::query(
        r#"
        select id, ts, broker_order_id, symbol, side, qty, price, fee, tax, meta_json
        from fills
        where broker_order_id = ?1
        order by id asc
        "#,
    )
    .bind(broker_order_id)
    .fetch_all(pool)
    .await
    .map_err(StoreError::unavailable("list_fills_for_order"))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let meta_json: String = row
            .try_get("meta_json")
            .map_err(StoreError::unavailable("fills.meta_json"))?;
        out.push(FillRow {
            id: row.try_get("id").map_err(StoreError::unavailable("fills.id"))?,
            ts: row.try_get("ts").map_err(StoreError::unavailable("fills.ts"))?,
            broker_order_id: row
                .try_get("broker_order_id")
                .map_err(StoreError::unavailable("fills.broker_order_id"))?,
            symbol: row
                .try_get("symbol")
                .map_err(StoreError::unavailable("fills.symbol"))?,
            side: row
                .try_get("side")
                .map_err(StoreError::unavailable("fills.side"))?,
            qty: row.try_get("qty").map_err(StoreError::unavailable("fills.qty"))?,
            price: row
                .try_get("price")
                .map_err(StoreError::unavailable("fills.price"))?,
            fee: row.try_get("fee").map_err(StoreError::unavailable("fills.fee"))?,
            tax: row.try_get("tax").map_err(StoreError::unavailable("fills.tax"))?,
            meta: meta_from_text(&meta_json),
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewTrade {
    pub open_ts: String,
    pub symbol: String,
    pub direction: String,
    pub qty: f64,
    pub entry: f64,
    pub reason_open: Option<String>,
    pub meta: Value,
}

#[derive(Debug, Clone)]
pub struct TradeRow {
    pub id: i64,
    pub open_ts: String,
    pub close_ts: Option<String>,
    pub symbol: String,
    pub direction: String,
    pub qty: f64,
    pub entry: f64,
    pub exit: Option<f64>,
    pub pnl: Option<f64>,
    pub pnl_fraction: Option<f64>,
    pub reason_open: Option<String>,
    pub reason_close: Option<String>,
    pub meta: Value,
}

fn trade_from_row(row: &SqliteRow) -> Result<TradeRow, StoreError> {
    let meta_json: String = row
        .try_get("meta_json")
        .map_err(StoreError::unavailable("trades.meta_json"))?;
    Ok(TradeRow {
        id: row.try_get("id").map_err(StoreError::unavailable("trades.id"))?,
        open_ts: row
            .try_get("open_ts")
            .map_err(StoreError::unavailable("trades.open_ts"))?,
        close_ts: row
            .try_get("close_ts")
            .map_err(StoreError::unavailable("trades.close_ts"))?,
        symbol: row
            .try_get("symbol")
            .map_err(StoreError::unavailable("trades.symbol"))?,
        direction: row
            .try_get("direction")
            .map_err(StoreError::unavailable("trades.direction"))?,
        qty: row.try_get("qty").map_err(StoreError::unavailable("trades.qty"))?,
        entry: row
            .try_get("entry")
            .map_err(StoreError::unavailable("trades.entry"))?,
        exit: row
            .try_get("exit")
            .map_err(StoreError::unavailable("trades.exit"))?,
        pnl: row.try_get("pnl").map_err(StoreError::unavailable("trades.pnl"))?,
        pnl_fraction: row
            .try_get("pnl_fraction")
            .map_err(StoreError::unavailable("trades.pnl_fraction"))?,
        reason_open: row
            .try_get("reason_open")
            .map_err(StoreError::unavailable("trades.reason_open"))?,
        reason_close: row
            .try_get("reason_close")
            .map_err(StoreError::unavailable("trades.reason_close"))?,
        meta: meta_from_text(&meta_json),
    })
}

pub async fn insert_trade<'e, E>(ex: E, t: &NewTrade) -> Result<i64, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let res = sqlx::query(
        r#"
        insert into trades (open_ts, symbol, direction, qty, entry, reason_open, meta_json)
        values (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&t.open_ts)
    .bind(&t.symbol)
    .bind(&t.direction)
    .bind(t.qty)
    .bind(t.entry)
    .bind(&t.reason_open)
    .bind(meta_to_text(&t.meta))
    .execute(ex)
    .await
    .map_err(StoreError::unavailable("insert_trade"))?;

    Ok(res.last_insert_rowid())
}

/// Close the newest still-open trade for `symbol`. One open trade per
/// symbol is the v1 invariant; the subquery keeps this correct even if
/// that invariant is ever violated upstream.
pub async fn close_latest_open_trade<'e, E>(
    ex: E,
    symbol: &str,
    close_ts: &str,
    exit: f64,
    pnl: f64,
    pnl_fraction: f64,
    reason_close: &str,
) -> Result<bool, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let res = sqlx::query(
        r#"
        update trades
           set close_ts = ?2,
               exit = ?3,
               pnl = ?4,
               pnl_fraction = ?5,
               reason_close = ?6
         where id = (
            select id from trades
            where symbol = ?1 and close_ts is null
            order by id desc
            limit 1
         )
        "#,
    )
    .bind(symbol)
    .bind(close_ts)
    .bind(exit)
    .bind(pnl)
    .bind(pnl_fraction)
    .bind(reason_close)
    .execute(ex)
    .await
    .map_err(StoreError::unavailable("close_latest_open_trade"))?;

    Ok(res.rows_affected() > 0)
}

pub async fn fetch_open_trade<'e, E>(ex: E, symbol: &str) -> Result<Option<TradeRow>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query(
        r#"
        select id, open_ts, close_ts, symbol, direction, qty, entry, exit,
               pnl, pnl_fraction, reason_open, reason_close, meta_json
        from trades
        where symbol = ?1 and close_ts is null
        order by id desc
        limit 1
        "#,
    )
    .bind(symbol)
    .fetch_optional(ex)
    .await
    .map_err(StoreError::unavailable("fetch_open_trade"))?;

    row.as_ref().map(trade_from_row).transpose()
}

/// Sum of realized pnl for trades closed on one Taipei trading day.
pub async fn sum_realized_pnl_for_day(
    pool: &SqlitePool,
    day_prefix: &str,
) -> Result<f64, StoreError> {
    let (sum,): (f64,) = sqlx::query_as(
        r#"
        select coalesce(sum(pnl), 0.0)
        from trades
        where close_ts is not null and close_ts like ?1 || '%'
        "#,
    )
    .bind(day_prefix)
    .fetch_one(pool)
    .await
    .map_err(StoreError::unavailable("sum_realized_pnl_for_day"))?;

    Ok(sum)
}

/// Most recent closed-trade pnls, newest first (consecutive-loss scan).
pub async fn recent_closed_trade_pnls(
    pool: &SqlitePool,
    limit: i64,
) -> Result<Vec<f64>, StoreError> {
    let rows: Vec<(Option<f64>,)> = sqlx::query_as(
        r#"
        select pnl from trades
        where close_ts is not null
        order by id desc
        limit ?1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(StoreError::unavailable("recent_closed_trade_pnls"))?;

    Ok(rows.into_iter().map(|(p,)| p.unwrap_or(0.0)).collect())
}

/// `close_ts` of the most recent losing trade, if any.
pub async fn last_loss_close_ts(pool: &SqlitePool) -> Result<Option<String>, StoreError> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        select close_ts from trades
        where close_ts is not null and pnl < 0
        order by id desc
        limit 1
        "#,
    )
    .fetch_optional(pool)
    .await
    .map_err(StoreError::unavailable("last_loss_close_ts"))?;

    Ok(row.map(|(ts,)| ts))
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PositionRow {
    pub symbol: String,
    /// `"LONG"` / `"SHORT"`; `None` iff `qty == 0`.
    pub side: Option<String>,
    pub qty: f64,
    pub avg_price: f64,
    pub open_ts: Option<String>,
}

impl PositionRow {
    pub fn flat(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            side: None,
            qty: 0.0,
            avg_price: 0.0,
            open_ts: None,
        }
    }
}

pub async fn upsert_position<'e, E>(ex: E, p: &PositionRow) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        insert into positions (symbol, side, qty, avg_price, open_ts)
        values (?1, ?2, ?3, ?4, ?5)
        on conflict(symbol) do update
            set side = excluded.side,
                qty = excluded.qty,
                avg_price = excluded.avg_price,
                open_ts = excluded.open_ts
        "#,
    )
    .bind(&p.symbol)
    .bind(&p.side)
    .bind(p.qty)
    .bind(p.avg_price)
    .bind(&p.open_ts)
    .execute(ex)
    .await
    .map_err(StoreError::unavailable("upsert_position"))?;
    Ok(())
}

pub async fn fetch_position<'e, E>(ex: E, symbol: &str) -> Result<Option<PositionRow>, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query(
        r#"
        select symbol, side, qty, avg_price, open_ts
        from positions
        where symbol = ?1
        "#,
    )
    .bind(symbol)
    .fetch_optional(ex)
    .await
    .map_err(StoreError::unavailable("fetch_position"))?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(PositionRow {
        symbol: row
            .try_get("symbol")
            .map_err(StoreError::unavailable("positions.symbol"))?,
        side: row
            .try_get("side")
            .map_err(StoreError::unavailable("positions.side"))?,
        qty: row
            .try_get("qty")
            .map_err(StoreError::unavailable("positions.qty"))?,
        avg_price: row
            .try_get("avg_price")
            .map_err(StoreError::unavailable("positions.avg_price"))?,
        open_ts: row
            .try_get("open_ts")
            .map_err(StoreError::unavailable("positions.open_ts"))?,
    }))
}

// ---------------------------------------------------------------------------
// Safety state
// ---------------------------------------------------------------------------

/// Point lookup of one safety key (`cooldown`, `kill`).
pub async fn safety_state_get(pool: &SqlitePool, key: &str) -> Result<Option<Value>, StoreError> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        select value_json from safety_state where key = ?1
        "#,
    )
    .bind(key)
    .fetch_optional(pool)
    .await
    .map_err(StoreError::unavailable("safety_state_get"))?;

    Ok(row.map(|(v,)| meta_from_text(&v)))
}

pub async fn safety_state_set(
    pool: &SqlitePool,
    key: &str,
    value: &Value,
    ts: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        insert into safety_state (key, value_json, ts)
        values (?1, ?2, ?3)
        on conflict(key) do update
            set value_json = excluded.value_json,
                ts = excluded.ts
        "#,
    )
    .bind(key)
    .bind(meta_to_text(value))
    .bind(ts)
    .execute(pool)
    .await
    .map_err(StoreError::unavailable("safety_state_set"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Health checks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewHealthCheck {
    pub ts: String,
    pub name: String,
    pub kind: String,
    pub status: String,
    pub summary: Value,
}

pub async fn insert_health_check(pool: &SqlitePool, hc: &NewHealthCheck) -> Result<i64, StoreError> {
    let res = sqlx::query(
        r#"
        insert into health_checks (ts, name, kind, status, summary_json)
        values (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(&hc.ts)
    .bind(&hc.name)
    .bind(&hc.kind)
    .bind(&hc.status)
    .bind(meta_to_text(&hc.summary))
    .execute(pool)
    .await
    .map_err(StoreError::unavailable("insert_health_check"))?;

    Ok(res.last_insert_rowid())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
