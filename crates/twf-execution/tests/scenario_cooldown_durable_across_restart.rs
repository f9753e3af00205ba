//! Cooldowns live in the store, not in process memory: after a restart
//! (new pool, new engines over the same database file) an active cooldown
//! still rejects intents with the same code.

mod common;

use common::{at, build_gateway, seed_book};
use serde_json::json;
use twf_execution::{GatewayConfig, RejectPolicy};
use twf_risk::RiskConfig;
use twf_safety::{SafetyConfig, SafetyEngine};
use twf_schemas::{OrderIntent, Side};

#[tokio::test]
async fn cooldown_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("cooldown_durability.sqlite3");
    let db_path = db_path.to_str().unwrap();

    let now = at("2026-01-29T10:01:00+08:00");
    let intent = || {
        OrderIntent::new("TMF", Side::Buy, 1.0, "MARKET")
            .with_meta(json!({ "ref_price": 20000.0, "stop_price": 19990.0 }))
    };

    // First process: engage a 60s cooldown, observe the reject.
    {
        let pool = twf_store::testkit_file_pool(db_path).await.unwrap();
        seed_book(&pool, "2026-01-29T10:00:55+08:00").await;

        let safety = SafetyEngine::new(pool.clone(), SafetyConfig::default());
        safety
            .request_cooldown(now, 60, "TEST", "x", json!({}))
            .await
            .unwrap();

        let gw = build_gateway(
            &pool,
            SafetyConfig::default(),
            RiskConfig::default(),
            RejectPolicy::builtin(),
            GatewayConfig::default(),
        );
        let out = gw.place_order(now, intent()).await.unwrap();
        assert!(!out.ok);
        assert_eq!(out.exec_code, "SAFETY_COOLDOWN_ACTIVE");

        pool.close().await;
    }

    // "Restart": fresh pool and engines over the same file, still inside
    // the 60s window.
    {
        let pool = twf_store::testkit_file_pool(db_path).await.unwrap();
        let gw = build_gateway(
            &pool,
            SafetyConfig::default(),
            RiskConfig::default(),
            RejectPolicy::builtin(),
            GatewayConfig::default(),
        );

        let later = at("2026-01-29T10:01:30+08:00");
        let out = gw.place_order(later, intent()).await.unwrap();
        assert!(!out.ok);
        assert_eq!(out.exec_code, "SAFETY_COOLDOWN_ACTIVE");

        // Once the window has elapsed the gate clears on its own.
        let after = at("2026-01-29T10:02:30+08:00");
        let out2 = gw.place_order(after, intent()).await.unwrap();
        assert_ne!(out2.exec_code, "SAFETY_COOLDOWN_ACTIVE");
        assert!(out2.ok, "{out2:?}");
    }
}
