//! Gateway policy side effects: a COOLDOWN-action reject arms the durable
//! cooldown, and the per-intent deadline persists its own REJECTED row.

mod common;

use std::time::Duration;

use common::{at, build_gateway, migrated_pool, seed_book};
use serde_json::json;
use twf_execution::{GatewayConfig, RejectPolicy};
use twf_risk::RiskConfig;
use twf_safety::SafetyConfig;
use twf_schemas::{OrderIntent, Side};
use twf_store::fetch_order;

#[tokio::test]
async fn cooldown_action_arms_durable_cooldown() {
    let pool = migrated_pool().await;
    // Stale book (threshold 15s) + policy mapping SAFETY_* to COOLDOWN.
    seed_book(&pool, "2026-01-29T10:00:00+08:00").await;
    let now = at("2026-01-29T10:01:00+08:00");

    let policy: RejectPolicy = serde_json::from_value(json!({
        "by_prefix": { "SAFETY_": { "action": "COOLDOWN", "severity": "HIGH" } },
    }))
    .unwrap();

    let gw = build_gateway(
        &pool,
        SafetyConfig {
            max_bidask_age_seconds: 15.0,
            ..Default::default()
        },
        RiskConfig::default(),
        policy,
        GatewayConfig::default(),
    );

    let intent = || {
        OrderIntent::new("TMF", Side::Buy, 1.0, "MARKET")
            .with_meta(json!({ "ref_price": 20000.0, "stop_price": 19990.0 }))
    };

    let first = gw.place_order(now, intent()).await.unwrap();
    assert_eq!(first.exec_code, "SAFETY_FEED_STALE");
    assert_eq!(first.reject.as_ref().unwrap().action.as_str(), "COOLDOWN");

    // The reject armed the cooldown; the next intent trips on it first.
    let second = gw.place_order(now, intent()).await.unwrap();
    assert_eq!(second.exec_code, "SAFETY_COOLDOWN_ACTIVE");
}

#[tokio::test]
async fn deadline_exceeded_persists_reject_row() {
    let pool = migrated_pool().await;
    seed_book(&pool, "2026-01-29T10:00:55+08:00").await;
    let now = at("2026-01-29T10:01:00+08:00");

    let gw = build_gateway(
        &pool,
        SafetyConfig {
            max_bidask_age_seconds: 15.0,
            ..Default::default()
        },
        RiskConfig::default(),
        RejectPolicy::builtin(),
        GatewayConfig {
            deadline: Some(Duration::ZERO),
            ..Default::default()
        },
    );

    let intent = OrderIntent::new("TMF", Side::Buy, 1.0, "MARKET")
        .with_meta(json!({ "ref_price": 20000.0, "stop_price": 19990.0 }));

    let out = gw.place_order(now, intent).await.unwrap();
    assert!(!out.ok);
    assert_eq!(out.exec_code, "GATEWAY_DEADLINE_EXCEEDED");
    // Safety ran before the deadline tripped.
    assert!(out.safety.as_ref().unwrap().ok);

    let row = fetch_order(&pool, &out.broker_order_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "REJECTED");
    assert_eq!(row.verdict_code.as_deref(), Some("GATEWAY_DEADLINE_EXCEEDED"));
}
