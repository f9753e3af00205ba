//! Per-trade worst-loss bound: BUY 2 LIMIT@20000 with a stop 100 points
//! away risks 100 * 2 * 10 = 2000 NTD, above the 1500 cap.

mod common;

use common::{at, default_gateway, migrated_pool, seed_book};
use serde_json::json;
use twf_schemas::{OrderIntent, Side};
use twf_store::fetch_order;

#[tokio::test]
async fn per_trade_loss_cap_rejects() {
    let pool = migrated_pool().await;
    seed_book(&pool, "2026-01-29T10:00:55+08:00").await;
    let now = at("2026-01-29T10:01:00+08:00");

    let gw = default_gateway(&pool);
    let intent = OrderIntent::new("TMF", Side::Buy, 2.0, "LIMIT")
        .with_price(20000.0)
        .with_meta(json!({ "stop_price": 19900.0 }));

    let out = gw.place_order(now, intent).await.unwrap();

    assert!(!out.ok);
    assert_eq!(out.exec_code, "RISK_PER_TRADE_MAX_LOSS");
    let risk = out.risk.unwrap();
    assert_eq!(risk.details["per_trade_risk"], 2000.0);
    assert_eq!(risk.details["per_trade_max_loss"], 1500.0);

    let row = fetch_order(&pool, &out.broker_order_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "REJECTED");
    assert_eq!(row.meta["risk_verdict"]["details"]["per_trade_risk"], 2000.0);
}

#[tokio::test]
async fn bounded_stop_passes_the_cap() {
    let pool = migrated_pool().await;
    seed_book(&pool, "2026-01-29T10:00:55+08:00").await;
    let now = at("2026-01-29T10:01:00+08:00");

    let gw = default_gateway(&pool);
    // 50 points * 2 * 10 = 1000 NTD, within the cap.
    let intent = OrderIntent::new("TMF", Side::Buy, 2.0, "LIMIT")
        .with_price(20000.0)
        .with_meta(json!({ "stop_price": 19950.0 }));

    let out = gw.place_order(now, intent).await.unwrap();
    assert!(out.ok, "{out:?}");
}
