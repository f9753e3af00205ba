//! twf-oms
//!
//! Paper order-management system. Conservative, deterministic matching
//! against a caller-supplied reference price:
//!
//! - MARKET (and MWP, whose protection anchor is enforced upstream by
//!   preflight) fills at the reference price.
//! - LIMIT BUY fills iff reference <= limit; LIMIT SELL iff reference >=
//!   limit. A LIMIT without a price is rejected outright.
//! - `available_liquidity` caps the fill quantity (partial fills).
//!
//! Every fill books per-side fee + tax from the [`CostModel`] and commits
//! its order/fill/position/trade mutations in ONE transaction.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use twf_schemas::{OrderStatus, OrderType, Side, TradeDirection, Verdict};
use twf_store::{
    clock, close_latest_open_trade, fetch_position, insert_fill, insert_order, insert_trade,
    update_order_status_meta, upsert_position, NewFill, NewOrder, NewTrade, PositionRow,
    StoreError,
};

pub mod cost;

pub use cost::{CostError, CostModel, FeeSpec, RoundTripCost, TAX_RATE_EQUITY_FUTURES};

/// Quantity comparison tolerance (quantities are floats end to end).
const QTY_EPS: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// An order as the OMS tracks it between submit and terminal status.
#[derive(Clone, Debug, PartialEq)]
pub struct OmsOrder {
    pub broker_order_id: String,
    pub ts: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub meta: Value,
}

impl OmsOrder {
    pub fn remaining(&self) -> f64 {
        self.qty - self.filled_qty
    }
}

/// One executed fill.
#[derive(Clone, Debug, PartialEq)]
pub struct OmsFill {
    pub id: i64,
    pub ts: String,
    pub broker_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub fee: f64,
    pub tax: f64,
    pub meta: Value,
}

// ---------------------------------------------------------------------------
// PaperOms
// ---------------------------------------------------------------------------

pub struct PaperOms {
    pool: SqlitePool,
    costs: CostModel,
}

impl PaperOms {
    pub fn new(pool: SqlitePool, costs: CostModel) -> Self {
        Self { pool, costs }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn costs(&self) -> &CostModel {
        &self.costs
    }

    /// Allocate a broker id and persist the order with status NEW.
    pub async fn submit_order(
        &self,
        now: DateTime<Utc>,
        symbol: &str,
        side: Side,
        qty: f64,
        order_type: OrderType,
        price: Option<f64>,
        meta: Value,
    ) -> Result<OmsOrder> {
        let order = OmsOrder {
            broker_order_id: Uuid::new_v4().simple().to_string(),
            ts: clock::now_iso(now),
            symbol: symbol.to_string(),
            side,
            qty,
            order_type,
            price,
            status: OrderStatus::New,
            filled_qty: 0.0,
            meta,
        };

        insert_order(
            &self.pool,
            &NewOrder {
                ts: order.ts.clone(),
                broker_order_id: order.broker_order_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side.as_str().to_string(),
                qty: order.qty,
                price: order.price,
                order_type: order.order_type.as_str().to_string(),
                status: order.status.as_str().to_string(),
                verdict_code: None,
                decision_domain: None,
                decision_action: None,
                meta: order.meta.clone(),
            },
        )
        .await?;

        debug!(
            broker_order_id = %order.broker_order_id,
            symbol = %order.symbol,
            side = %order.side,
            qty = order.qty,
            "paper order submitted"
        );
        Ok(order)
    }

    /// Match an order against a reference price, producing zero or more
    /// fills (at most one per call).
    pub async fn match_order(
        &self,
        now: DateTime<Utc>,
        order: &mut OmsOrder,
        reference_price: f64,
        available_liquidity: Option<f64>,
        reason: &str,
    ) -> Result<Vec<OmsFill>> {
        if order.status.is_terminal() {
            return Ok(Vec::new());
        }
        let remaining = order.remaining();
        if remaining <= QTY_EPS {
            return Ok(Vec::new());
        }

        let crossed = match order.order_type {
            OrderType::Market | OrderType::Mwp => true,
            OrderType::Limit => {
                let Some(limit) = order.price else {
                    // Un-priceable LIMIT: terminal reject, persisted with
                    // its verdict envelope like every other reject.
                    order.status = OrderStatus::Rejected;
                    let verdict = Verdict::block(
                        "EXEC_LIMIT_PRICE_MISSING",
                        "LIMIT order has no limit price; cannot match",
                        json!({ "broker_order_id": order.broker_order_id }),
                    );
                    let mut meta = meta_with_filled_qty(&order.meta, order.filled_qty);
                    if let Value::Object(m) = &mut meta {
                        m.insert("reject_decision".to_string(), json!({
                            "ok": false,
                            "code": verdict.code,
                            "domain": "EXEC",
                            "severity": "MED",
                            "action": "REJECT",
                            "reason": verdict.reason,
                            "details": verdict.details,
                        }));
                    }
                    twf_store::update_order_decision(
                        &self.pool,
                        &order.broker_order_id,
                        order.status.as_str(),
                        &verdict.code,
                        "EXEC",
                        "REJECT",
                        &meta,
                    )
                    .await?;
                    order.meta = meta;
                    return Ok(Vec::new());
                };
                match order.side {
                    Side::Buy => reference_price <= limit,
                    Side::Sell => reference_price >= limit,
                }
            }
        };
        if !crossed {
            return Ok(Vec::new());
        }

        let fill_qty = match available_liquidity {
            Some(liq) => remaining.min(liq),
            None => remaining,
        };
        if fill_qty <= QTY_EPS {
            return Ok(Vec::new());
        }

        let (fee, tax) = self
            .costs
            .per_side_cost(&order.symbol, reference_price, fill_qty);

        let fill_ts = clock::now_iso(now);
        let fill_meta = json!({ "reason": reason, "order_meta": order.meta });

        let new_filled = order.filled_qty + fill_qty;
        let new_status = if new_filled + QTY_EPS >= order.qty {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let new_meta = meta_with_filled_qty(&order.meta, new_filled);

        // Order + fill + position + trade mutate together or not at all.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::tx_failed("match begin"))?;

        let fill_id = insert_fill(
            &mut *tx,
            &NewFill {
                ts: fill_ts.clone(),
                broker_order_id: order.broker_order_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side.as_str().to_string(),
                qty: fill_qty,
                price: reference_price,
                fee,
                tax,
                meta: fill_meta.clone(),
            },
        )
        .await?;

        update_order_status_meta(
            &mut *tx,
            &order.broker_order_id,
            new_status.as_str(),
            &new_meta,
        )
        .await?;

        let fill = OmsFill {
            id: fill_id,
            ts: fill_ts,
            broker_order_id: order.broker_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty: fill_qty,
            price: reference_price,
            fee,
            tax,
            meta: fill_meta,
        };

        self.apply_fill_to_position_and_trade(&mut tx, &fill, reason)
            .await?;

        tx.commit()
            .await
            .map_err(StoreError::tx_failed("match commit"))?;

        order.filled_qty = new_filled;
        order.status = new_status;
        order.meta = new_meta;

        Ok(vec![fill])
    }

    /// Single-position-per-symbol bookkeeping (v1).
    ///
    /// Transitions:
    /// - flat + fill             -> open position, open trade row
    /// - same direction          -> VWAP average, no new trade row
    /// - opposite, partial       -> reduce quantity, trade stays open
    /// - opposite, full          -> close trade (pnl + pnl_fraction)
    /// - opposite, over          -> close, then flip with the leftover
    async fn apply_fill_to_position_and_trade(
        &self,
        tx: &mut SqliteConnection,
        fill: &OmsFill,
        reason: &str,
    ) -> Result<()> {
        let sym = &fill.symbol;
        let mult = self.costs.multiplier(sym).unwrap_or(1.0);
        let mut pos = fetch_position(&mut *tx, sym)
            .await?
            .unwrap_or_else(|| PositionRow::flat(sym.clone()));

        let order_meta = fill.meta.get("order_meta").cloned().unwrap_or(Value::Null);
        let trade_meta = json!({ "multiplier": mult, "order_meta": order_meta });

        // Flat: open.
        if pos.qty.abs() <= QTY_EPS {
            let direction = match fill.side {
                Side::Buy => TradeDirection::Long,
                Side::Sell => TradeDirection::Short,
            };
            pos.qty = fill.qty;
            pos.side = Some(direction.as_str().to_string());
            pos.avg_price = fill.price;
            pos.open_ts = Some(fill.ts.clone());
            upsert_position(&mut *tx, &pos).await?;

            insert_trade(
                &mut *tx,
                &NewTrade {
                    open_ts: fill.ts.clone(),
                    symbol: sym.clone(),
                    direction: direction.as_str().to_string(),
                    qty: fill.qty,
                    entry: fill.price,
                    reason_open: Some("fill_open".to_string()),
                    meta: trade_meta,
                },
            )
            .await?;
            return Ok(());
        }

        let long = pos.side.as_deref() == Some("LONG");
        let buying = fill.side == Side::Buy;

        // Same direction: VWAP average, one trade row per position (v1).
        if long == buying {
            let new_qty = pos.qty + fill.qty;
            pos.avg_price = (pos.avg_price * pos.qty + fill.price * fill.qty) / new_qty;
            pos.qty = new_qty;
            upsert_position(&mut *tx, &pos).await?;
            return Ok(());
        }

        // Opposite direction, partial: reduce only. PnL recognition waits
        // until flat (v1 keeps one trade row per position).
        let reduce_qty = fill.qty;
        if reduce_qty < pos.qty - QTY_EPS {
            pos.qty -= reduce_qty;
            upsert_position(&mut *tx, &pos).await?;
            return Ok(());
        }

        // Close to flat (or flip).
        let closed_qty = pos.qty;
        let entry = pos.avg_price;
        let exit = fill.price;
        let sign = if long { 1.0 } else { -1.0 };
        let pnl = (exit - entry) * sign * closed_qty * mult;
        let pnl_fraction = if entry > 0.0 {
            pnl / (entry * closed_qty * mult)
        } else {
            0.0
        };

        close_latest_open_trade(&mut *tx, sym, &fill.ts, exit, pnl, pnl_fraction, reason).await?;

        let leftover = reduce_qty - closed_qty;
        if leftover > QTY_EPS {
            let direction = if buying {
                TradeDirection::Long
            } else {
                TradeDirection::Short
            };
            pos.qty = leftover;
            pos.side = Some(direction.as_str().to_string());
            pos.avg_price = fill.price;
            pos.open_ts = Some(fill.ts.clone());
            upsert_position(&mut *tx, &pos).await?;

            insert_trade(
                &mut *tx,
                &NewTrade {
                    open_ts: fill.ts.clone(),
                    symbol: sym.clone(),
                    direction: direction.as_str().to_string(),
                    qty: leftover,
                    entry: fill.price,
                    reason_open: Some("fill_flip_open".to_string()),
                    meta: json!({
                        "multiplier": mult,
                        "order_meta": fill.meta.get("order_meta").cloned().unwrap_or(Value::Null),
                    }),
                },
            )
            .await?;
        } else {
            upsert_position(&mut *tx, &PositionRow::flat(sym.clone())).await?;
        }

        Ok(())
    }

    /// Persist a gateway-level reject as a terminal order row. Used for
    /// intents that never reach `submit_order`.
    pub async fn persist_rejected_order(
        &self,
        now: DateTime<Utc>,
        symbol: &str,
        side: &str,
        qty: f64,
        order_type: &str,
        price: Option<f64>,
        verdict: &Verdict,
        domain: &str,
        action: &str,
        meta: Value,
    ) -> Result<String> {
        let broker_order_id = Uuid::new_v4().simple().to_string();
        insert_order(
            &self.pool,
            &NewOrder {
                ts: clock::now_iso(now),
                broker_order_id: broker_order_id.clone(),
                symbol: symbol.to_string(),
                side: side.to_string(),
                qty,
                price,
                order_type: order_type.to_string(),
                status: OrderStatus::Rejected.as_str().to_string(),
                verdict_code: Some(verdict.code.clone()),
                decision_domain: Some(domain.to_string()),
                decision_action: Some(action.to_string()),
                meta,
            },
        )
        .await?;
        Ok(broker_order_id)
    }
}

fn meta_with_filled_qty(meta: &Value, filled_qty: f64) -> Value {
    let mut map = match meta {
        Value::Object(m) => m.clone(),
        _ => serde_json::Map::new(),
    };
    map.insert("filled_qty".to_string(), json!(filled_qty));
    Value::Object(map)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
