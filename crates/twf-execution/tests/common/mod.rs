//! Shared scenario wiring: migrated store, seeded book events, and a
//! gateway assembled from per-test configs.

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::SqlitePool;

use twf_execution::{GatewayConfig, OrderGateway, RejectPolicy};
use twf_oms::{CostModel, PaperOms};
use twf_risk::{RiskConfig, RiskEngine};
use twf_safety::{SafetyConfig, SafetyEngine};
use twf_store::{append_event, clock, NewEvent};

pub fn at(s: &str) -> DateTime<Utc> {
    clock::parse_ts_flexible(s).expect("test timestamp")
}

pub async fn migrated_pool() -> SqlitePool {
    twf_store::testkit_memory_pool().await.expect("memory pool")
}

/// Append a real (non-synthetic) TMFB6 book event whose `recv_ts` is `ts`.
pub async fn seed_book(pool: &SqlitePool, ts: &str) {
    append_event(
        pool,
        &NewEvent {
            ts: ts.to_string(),
            kind: "bidask_fop_v1".to_string(),
            payload: json!({
                "code": "TMFB6",
                "bid_price": [20000.0, 19999.0],
                "ask_price": [20001.0, 20002.0],
                "bid_volume": [5.0, 3.0, 2.0, 1.0, 1.0],
                "ask_volume": [5.0, 3.0, 2.0, 1.0, 1.0],
                "synthetic": false,
                "recv_ts": ts,
            }),
            producer: "recorder".to_string(),
            ingest_ts: ts.to_string(),
        },
    )
    .await
    .expect("seed book event");
}

pub fn build_gateway(
    pool: &SqlitePool,
    safety_cfg: SafetyConfig,
    risk_cfg: RiskConfig,
    policy: RejectPolicy,
    gw_cfg: GatewayConfig,
) -> OrderGateway {
    OrderGateway::new(
        SafetyEngine::new(pool.clone(), safety_cfg),
        RiskEngine::new(pool.clone(), risk_cfg),
        PaperOms::new(pool.clone(), CostModel::default()),
        policy,
        gw_cfg,
    )
}

/// Gateway with tight feed-freshness (15s) and default risk.
pub fn default_gateway(pool: &SqlitePool) -> OrderGateway {
    build_gateway(
        pool,
        SafetyConfig {
            max_bidask_age_seconds: 15.0,
            ..Default::default()
        },
        RiskConfig::default(),
        RejectPolicy::builtin(),
        GatewayConfig::default(),
    )
}
