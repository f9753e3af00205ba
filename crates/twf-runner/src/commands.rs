//! Command handlers for the `twf` binary.

use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{info, warn};

use twf_execution::{GatewayConfig, OrderGateway, RejectPolicy};
use twf_market::{build_bars_1m, read_market_metrics};
use twf_oms::{CostModel, PaperOms};
use twf_risk::{RiskConfig, RiskEngine};
use twf_safety::{SafetyConfig, SafetyEngine};
use twf_schemas::{OrderIntent, Side};
use twf_store::{
    append_event, clock, insert_health_check, list_recent_orders, NewEvent, NewHealthCheck,
};

use crate::lock::SingleInstanceLock;
use crate::DbCmd;

async fn open_pool(db_path: &str) -> Result<SqlitePool> {
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {parent:?}"))?;
        }
    }
    let pool = twf_store::connect(db_path).await?;
    twf_store::migrate(&pool).await?;
    Ok(pool)
}

// ---------------------------------------------------------------------------
// db
// ---------------------------------------------------------------------------

pub async fn db(db_path: &str, cmd: DbCmd) -> Result<()> {
    match cmd {
        DbCmd::Status => {
            let pool = twf_store::connect(db_path).await?;
            let st = twf_store::status(&pool).await?;
            println!("ok={} has_orders_table={}", st.ok, st.has_orders_table);
        }
        DbCmd::Migrate => {
            let pool = open_pool(db_path).await?;
            drop(pool);
            println!("migrated={db_path}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// bars
// ---------------------------------------------------------------------------

pub async fn bars(db_path: &str) -> Result<()> {
    let pool = open_pool(db_path).await?;
    let report = build_bars_1m(&pool).await?;
    println!(
        "tick_rows={} bars_upserted={} skipped={}",
        report.tick_rows, report.bars_upserted, report.skipped
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// recon
// ---------------------------------------------------------------------------

pub async fn recon(db_path: &str) -> Result<()> {
    let pool = open_pool(db_path).await?;
    let now = Utc::now();

    let report = twf_reconcile::reconcile_store(&pool).await?;
    twf_reconcile::record_reconcile_health(&pool, now, &report).await?;
    println!("recon ok={} code={} reason={}", report.ok, report.code, report.reason);

    // A broken state-store invariant is not a business reject: engage the
    // kill switch so no further intent trades on corrupt state.
    if !report.ok {
        let safety = SafetyEngine::new(pool.clone(), SafetyConfig::from_env());
        safety
            .request_kill(now, &report.code, &report.reason, report.details.clone())
            .await?;
        warn!(code = %report.code, "reconcile failed; kill switch engaged");
    }

    let stats = twf_reconcile::reject_stats_for_day(&pool, now).await?;
    println!("reject_stats={stats}");
    Ok(())
}

// ---------------------------------------------------------------------------
// seed-book
// ---------------------------------------------------------------------------

/// Inject a synthetic book event so offline flows have a quote. Tagged
/// `synthetic: true` with a `seed_` producer so live consumers skip it.
pub async fn seed_book(db_path: &str, code: Option<String>, bid: f64, ask: f64) -> Result<()> {
    let pool = open_pool(db_path).await?;
    let code = code
        .or_else(|| twf_config::env_str(twf_config::ENV_FOP_CODE))
        .unwrap_or_else(|| "TMFB6".to_string());
    let ts = clock::now_iso(Utc::now());

    let id = append_event(
        &pool,
        &NewEvent {
            ts: ts.clone(),
            kind: twf_schemas::events::KIND_BIDASK_FOP.to_string(),
            payload: json!({
                "code": code,
                "bid_price": [bid],
                "ask_price": [ask],
                "bid_volume": [1.0],
                "ask_volume": [1.0],
                "synthetic": true,
                "recv_ts": ts,
            }),
            producer: "seed_ops".to_string(),
            ingest_ts: ts,
        },
    )
    .await?;
    println!("seeded event_id={id} code={code} bid={bid} ask={ask}");
    Ok(())
}

// ---------------------------------------------------------------------------
// smoke
// ---------------------------------------------------------------------------

/// Paper-live smoke: case 1 must reject for a missing stop; case 2 must
/// pass the full chain and fill. Exit 2 when either expectation fails.
pub async fn smoke(db_path: &str) -> Result<ExitCode> {
    let _lock = match twf_config::env_str(twf_config::ENV_LOCK_DIR) {
        Some(dir) => Some(SingleInstanceLock::acquire(dir)?),
        None => None,
    };

    let pool = open_pool(db_path).await?;
    let now = Utc::now();

    // Env snapshot for the audit trail.
    let snapshot = twf_config::env_snapshot();
    let snapshot_hash = twf_config::env_snapshot_hash(&snapshot);
    insert_health_check(
        &pool,
        &NewHealthCheck {
            ts: clock::now_iso(now),
            name: "env_snapshot".to_string(),
            kind: "startup".to_string(),
            status: "OK".to_string(),
            summary: json!({ "env": snapshot, "hash": snapshot_hash }),
        },
    )
    .await?;

    let mut safety_cfg = SafetyConfig::from_env();
    if safety_cfg.dev_allow_stale {
        // Offline smoke convention: the allow-stale knob drops the whole
        // freshness requirement (there may be no book at all). The other
        // safety gates stay armed.
        warn!("dev allow-stale set; disabling feed-freshness requirement for smoke");
        safety_cfg.require_recent_bidask = false;
    }
    let fop_code = safety_cfg.fop_code.clone();
    let gw = OrderGateway::new(
        SafetyEngine::new(pool.clone(), safety_cfg),
        RiskEngine::new(pool.clone(), RiskConfig::from_env()),
        PaperOms::new(pool.clone(), CostModel::default()),
        RejectPolicy::builtin(),
        GatewayConfig::from_env(),
    );

    // Market snapshot from the store; never fabricated. The smoke keeps a
    // numeric ref-price fallback but only passes market_metrics through
    // when bid/ask truly exist.
    let mm = read_market_metrics(&pool, &fop_code, None, 20).await?;
    let (bid, market_metrics) = match &mm {
        Some(m) => (m.bid, m.to_meta()),
        None => {
            warn!("no bid/ask in store; smoke runs on ref-price fallback");
            (20000.0, json!({}))
        }
    };

    // Case 1: stop missing -> must be rejected with RISK_STOP_REQUIRED.
    let case1 = gw
        .place_order(
            now,
            OrderIntent::new("TMF", Side::Buy, 2.0, "MARKET").with_meta(json!({
                "ref_price": bid,
                "market_metrics": market_metrics,
                "paper_mode": true,
            })),
        )
        .await?;
    println!(
        "[smoke] case1_stop_missing ok={} code={}",
        case1.ok, case1.exec_code
    );
    if case1.ok || case1.exec_code != "RISK_STOP_REQUIRED" {
        eprintln!("[smoke] MISMATCH: expected RISK_STOP_REQUIRED reject");
        return Ok(ExitCode::from(2));
    }

    // Case 2: bounded risk -> must pass the chain, then fill on match.
    let case2 = gw
        .place_order(
            now,
            OrderIntent::new("TMF", Side::Buy, 2.0, "MARKET").with_meta(json!({
                "ref_price": bid,
                "stop_price": bid - 50.0,
                "market_metrics": market_metrics,
                "paper_mode": true,
            })),
        )
        .await?;
    println!(
        "[smoke] case2_pass_place ok={} code={} order_id={:?}",
        case2.ok, case2.exec_code, case2.broker_order_id
    );
    let Some(mut order) = case2.order else {
        eprintln!("[smoke] MISMATCH: expected accepted order, got {}", case2.exec_code);
        return Ok(ExitCode::from(2));
    };

    let fills = gw
        .oms()
        .match_order(now, &mut order, bid + 0.5, Some(10.0), "paper_live_smoke_fill")
        .await?;
    println!("[smoke] case2_fills={}", fills.len());
    if fills.len() != 1 {
        eprintln!("[smoke] MISMATCH: expected exactly one fill");
        return Ok(ExitCode::from(2));
    }

    for row in list_recent_orders(&pool, 8).await? {
        println!(
            "[smoke] order id={} ts={} {} {} qty={} type={} status={}",
            row.id, row.ts, row.symbol, row.side, row.qty, row.order_type, row.status
        );
    }

    info!("smoke flow complete");
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// strategies
// ---------------------------------------------------------------------------

/// One pass of the signal runner. Rebuilds bars, replays the most recent
/// ones into the trend strategy, and routes the last emitted signal
/// through the gate chain; an accepted order is matched at the bar close.
pub async fn strategies(db_path: &str, lookback: i64) -> Result<ExitCode> {
    use twf_market::fetch_recent_bars;
    use twf_strategy::{Strategy, StrategyContext, TrendConfig, TrendStrategy};

    let pool = open_pool(db_path).await?;
    let now = Utc::now();

    let report = build_bars_1m(&pool).await?;
    info!(bars = report.bars_upserted, skipped = report.skipped, "bars rebuilt");

    let symbol = twf_config::env_str(twf_config::ENV_FOP_CODE).unwrap_or_else(|| "TMFB6".to_string());
    let mut bars = fetch_recent_bars(&pool, "FOP", &symbol, lookback).await?;
    bars.reverse(); // chronological
    if bars.is_empty() {
        println!("[strategies] no bars for {symbol}; nothing to do");
        return Ok(ExitCode::SUCCESS);
    }

    let ctx = StrategyContext {
        now,
        symbol: symbol.clone(),
    };
    let mut strat = TrendStrategy::new(TrendConfig::default());
    let mut last_signal = None;
    for bar in &bars {
        if let Some(sig) = strat.on_bar_1m(&ctx, bar) {
            last_signal = Some((sig, bar.clone()));
        }
    }

    let Some((signal, bar)) = last_signal else {
        println!("[strategies] no signal from {} bars", bars.len());
        return Ok(ExitCode::SUCCESS);
    };
    println!(
        "[strategies] signal side={} qty={} reason={}",
        signal.side, signal.qty, signal.reason
    );

    let intent = signal.into_intent(&symbol, "trend", "v1", Some(bar.c));

    let gw = OrderGateway::new(
        SafetyEngine::new(pool.clone(), SafetyConfig::from_env()),
        RiskEngine::new(pool.clone(), RiskConfig::from_env()),
        PaperOms::new(pool.clone(), CostModel::default()),
        RejectPolicy::builtin(),
        GatewayConfig::from_env(),
    );

    let out = gw.place_order(now, intent).await?;
    println!(
        "[strategies] placed ok={} code={} order_id={:?}",
        out.ok, out.exec_code, out.broker_order_id
    );

    if let Some(mut order) = out.order {
        let fills = gw
            .oms()
            .match_order(now, &mut order, bar.c, Some(10.0), "strategy_runner_fill")
            .await?;
        println!("[strategies] fills={}", fills.len());
    }

    Ok(ExitCode::SUCCESS)
}
