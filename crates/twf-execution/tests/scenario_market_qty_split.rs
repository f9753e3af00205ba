//! A BUY 25 MARKET in the regular session exceeds the per-order cap of
//! 10. With the SPLIT policy the gateway submits three children (10, 10,
//! 5), each through the full gate chain, then records one parent row with
//! status SPLIT_SUBMITTED.

mod common;

use common::{at, build_gateway, migrated_pool, seed_book};
use serde_json::json;
use twf_execution::{GatewayConfig, RejectPolicy};
use twf_risk::RiskConfig;
use twf_safety::SafetyConfig;
use twf_schemas::{OrderIntent, OrderStatus, Side};
use twf_store::fetch_order;

fn split_risk_cfg() -> RiskConfig {
    RiskConfig {
        max_qty_per_order: 10.0,
        per_trade_max_loss: 2000.0,
        ..Default::default()
    }
}

#[tokio::test]
async fn market_qty_split_produces_children_and_parent() {
    let pool = migrated_pool().await;
    seed_book(&pool, "2026-01-29T10:00:55+08:00").await;
    let now = at("2026-01-29T10:01:00+08:00");

    let gw = build_gateway(
        &pool,
        SafetyConfig {
            max_bidask_age_seconds: 15.0,
            ..Default::default()
        },
        split_risk_cfg(),
        RejectPolicy::builtin(),
        GatewayConfig::default(),
    );

    // Stop 5 points away: worst case per child 10 * 5 * 10 = 500 NTD.
    let intent = OrderIntent::new("TMF", Side::Buy, 25.0, "MARKET")
        .with_meta(json!({ "ref_price": 20000.0, "stop_price": 19995.0 }));

    let out = gw.place_order(now, intent).await.unwrap();

    assert!(out.ok, "{out:?}");
    assert_eq!(out.status, OrderStatus::SplitSubmitted);
    assert_eq!(out.exec_code, "OK_SPLIT");
    assert_eq!(out.children.len(), 3);

    // Children: full-cap chunks plus remainder, each a real accepted order.
    let mut child_qtys = Vec::new();
    for (i, child_id) in out.children.iter().enumerate() {
        let row = fetch_order(&pool, child_id).await.unwrap().unwrap();
        assert_eq!(row.status, "NEW");
        assert_eq!(row.meta["split_index"], i as i64);
        assert_eq!(row.meta["split_limit"], 10.0);
        assert!(row.meta["split_parent_id"].as_str().unwrap().starts_with("SPLIT_"));
        assert_eq!(row.meta["risk_verdict"]["ok"], true);
        child_qtys.push(row.qty);
    }
    assert_eq!(child_qtys, vec![10.0, 10.0, 5.0]);

    // Parent row: SPLIT_SUBMITTED with the split envelope.
    let parent_id = out.broker_order_id.unwrap();
    assert!(parent_id.starts_with("SPLIT_"));
    let parent = fetch_order(&pool, &parent_id).await.unwrap().unwrap();
    assert_eq!(parent.status, "SPLIT_SUBMITTED");
    assert_eq!(parent.qty, 25.0);
    assert_eq!(parent.verdict_code.as_deref(), Some("OK_SPLIT"));
    assert_eq!(
        parent.meta["split_children"].as_array().unwrap().len(),
        3
    );
    assert_eq!(parent.meta["split_requested_qty"], 25.0);
}

#[tokio::test]
async fn risk_qty_tightening_shrinks_children() {
    let pool = migrated_pool().await;
    seed_book(&pool, "2026-01-29T10:00:55+08:00").await;
    let now = at("2026-01-29T10:01:00+08:00");

    // Risk allows at most 5 per order: the first 10-lot child is rejected
    // with RISK_QTY_LIMIT and the loop tightens the cap to 5.
    let gw = build_gateway(
        &pool,
        SafetyConfig {
            max_bidask_age_seconds: 15.0,
            ..Default::default()
        },
        RiskConfig {
            max_qty_per_order: 5.0,
            ..Default::default()
        },
        RejectPolicy::builtin(),
        GatewayConfig::default(),
    );

    let intent = OrderIntent::new("TMF", Side::Buy, 25.0, "MARKET")
        .with_meta(json!({ "ref_price": 20000.0, "stop_price": 19998.0 }));

    let out = gw.place_order(now, intent).await.unwrap();
    assert!(out.ok, "{out:?}");
    assert_eq!(out.children.len(), 5);
    for child_id in &out.children {
        let row = fetch_order(&pool, child_id).await.unwrap().unwrap();
        assert_eq!(row.qty, 5.0);
    }
}

#[tokio::test]
async fn split_loop_guard_aborts_runaway_loops() {
    let pool = migrated_pool().await;
    seed_book(&pool, "2026-01-29T10:00:55+08:00").await;
    let now = at("2026-01-29T10:01:00+08:00");

    let gw = build_gateway(
        &pool,
        SafetyConfig {
            max_bidask_age_seconds: 15.0,
            ..Default::default()
        },
        split_risk_cfg(),
        RejectPolicy::builtin(),
        GatewayConfig {
            split_max_children: 2,
            ..Default::default()
        },
    );

    let intent = OrderIntent::new("TMF", Side::Buy, 25.0, "MARKET")
        .with_meta(json!({ "ref_price": 20000.0, "stop_price": 19995.0 }));

    let out = gw.place_order(now, intent).await.unwrap();
    assert!(!out.ok);
    assert_eq!(out.exec_code, "EXEC_SPLIT_LOOP_GUARD");

    let parent = fetch_order(&pool, &out.broker_order_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parent.status, "REJECTED");
    assert_eq!(parent.verdict_code.as_deref(), Some("EXEC_SPLIT_LOOP_GUARD"));
    // The two children that made it in before the ceiling are recorded.
    assert_eq!(parent.meta["split_children"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn non_qty_child_reject_terminates_split() {
    let pool = migrated_pool().await;
    seed_book(&pool, "2026-01-29T10:00:55+08:00").await;
    let now = at("2026-01-29T10:01:00+08:00");

    // Children fail risk for a reason other than qty (missing stop).
    let gw = build_gateway(
        &pool,
        SafetyConfig {
            max_bidask_age_seconds: 15.0,
            ..Default::default()
        },
        split_risk_cfg(),
        RejectPolicy::builtin(),
        GatewayConfig::default(),
    );

    let intent = OrderIntent::new("TMF", Side::Buy, 25.0, "MARKET")
        .with_meta(json!({ "ref_price": 20000.0 }));

    let out = gw.place_order(now, intent).await.unwrap();
    assert!(!out.ok);
    assert_eq!(out.exec_code, "RISK_STOP_REQUIRED");
    assert!(out.children.is_empty());

    let parent = fetch_order(&pool, &out.broker_order_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parent.status, "REJECTED");
}
