//! Order Gateway: the single choke-point between trade intents and the
//! paper OMS.
//!
//! ```text
//! intent
//!   │ enrich meta.intent (correlation/causation/provenance/stop)
//!   ▼
//! Safety ─► Calendar ─► Preflight ─► Risk ─► OMS.submit
//!   │           │            │          │
//!   └───────────┴────────────┴──────────┴─► one REJECTED row with the
//!                                           full verdict envelope
//! ```
//!
//! Every branch writes exactly one order row; rejects are never silent.
//! Preflight oversize verdicts whose policy action is SPLIT enter the
//! split loop (MARKET qty-limit only): children run the full gate chain,
//! a `RISK_QTY_LIMIT` child verdict may tighten the child size (the only
//! permissible cap mutation), any other reject aborts, and a hard child
//! ceiling stops runaway loops with `EXEC_SPLIT_LOOP_GUARD`.

use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use twf_oms::{OmsOrder, PaperOms};
use twf_risk::RiskEngine;
use twf_safety::{market_open_verdict, SafetyEngine};
use twf_schemas::intent::meta_f64;
use twf_schemas::{
    IntentEnvelope, OrderIntent, OrderStatus, OrderType, RejectAction, StopSpec, Verdict,
};
use twf_store::{clock, insert_order, update_order_decision, NewOrder};

use crate::preflight::check_preflight;
use crate::taxonomy::{decision_from_verdict, RejectDecision, RejectPolicy};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Per-intent deadline; checked between gates.
    pub deadline: Option<Duration>,
    /// Hard ceiling on split-loop child submissions (including retries).
    pub split_max_children: usize,
    /// Cooldown applied when a reject's policy action is COOLDOWN.
    pub cooldown_on_reject_seconds: i64,
    /// Env knob: bypass the market-calendar gate (regression runs).
    pub calendar_env_bypass: bool,
    /// Provenance tag stamped into the intent envelope.
    pub runner: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            deadline: None,
            split_max_children: 20,
            cooldown_on_reject_seconds: 300,
            calendar_env_bypass: false,
            runner: None,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            split_max_children: twf_config::env_i64(
                twf_config::ENV_SPLIT_MAX_CHILDREN,
                d.split_max_children as i64,
            )
            .max(1) as usize,
            calendar_env_bypass: twf_config::env_truthy(
                twf_config::ENV_IGNORE_MARKET_CALENDAR,
                d.calendar_env_bypass,
            ),
            ..d
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What the caller gets back for one intent. All verdicts that were
/// evaluated are present, pass or fail; callers read the persisted order
/// row for the same envelope.
#[derive(Clone, Debug)]
pub struct PlaceOutcome {
    pub ok: bool,
    pub status: OrderStatus,
    pub broker_order_id: Option<String>,
    /// `"OK"`, `"OK_SPLIT"`, or the failing verdict code.
    pub exec_code: String,
    pub safety: Option<Verdict>,
    pub calendar: Option<Verdict>,
    pub preflight: Option<Verdict>,
    pub risk: Option<Verdict>,
    pub reject: Option<RejectDecision>,
    /// Child broker ids for a completed split.
    pub children: Vec<String>,
    /// The live OMS order on single-order acceptance.
    pub order: Option<OmsOrder>,
}

#[derive(Clone, Debug, Default)]
struct Stages {
    safety: Option<Verdict>,
    calendar: Option<Verdict>,
    preflight: Option<Verdict>,
    risk: Option<Verdict>,
}

impl Stages {
    /// Write the evaluated verdicts into the persisted meta envelope.
    fn write_into(&self, meta: &mut Map<String, Value>) {
        if let Some(v) = &self.safety {
            meta.insert("safety_verdict".to_string(), v.to_value());
        }
        if let Some(v) = &self.calendar {
            meta.insert("calendar_verdict".to_string(), v.to_value());
        }
        if let Some(v) = &self.preflight {
            meta.insert("preflight_verdict".to_string(), v.to_value());
        }
        if let Some(v) = &self.risk {
            meta.insert("risk_verdict".to_string(), v.to_value());
        }
    }
}

/// Internal chain result; `Split` only escapes when splitting is allowed.
enum ChainOutcome {
    Done(PlaceOutcome),
    Split {
        stages: Stages,
        meta: Map<String, Value>,
        preflight: Verdict,
    },
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub struct OrderGateway {
    safety: SafetyEngine,
    risk: RiskEngine,
    oms: PaperOms,
    policy: RejectPolicy,
    cfg: GatewayConfig,
}

impl OrderGateway {
    pub fn new(
        safety: SafetyEngine,
        risk: RiskEngine,
        oms: PaperOms,
        policy: RejectPolicy,
        cfg: GatewayConfig,
    ) -> Self {
        Self {
            safety,
            risk,
            oms,
            policy,
            cfg,
        }
    }

    pub fn oms(&self) -> &PaperOms {
        &self.oms
    }

    pub fn safety(&self) -> &SafetyEngine {
        &self.safety
    }

    /// Place one intent through the full gate chain.
    pub async fn place_order(&self, now: DateTime<Utc>, intent: OrderIntent) -> Result<PlaceOutcome> {
        let started = Instant::now();
        match self.run_chain(now, started, &intent, true).await? {
            ChainOutcome::Done(out) => Ok(out),
            ChainOutcome::Split {
                stages,
                meta,
                preflight,
            } => self.run_split_loop(now, started, &intent, stages, meta, preflight).await,
        }
    }

    // -----------------------------------------------------------------------
    // Gate chain
    // -----------------------------------------------------------------------

    async fn run_chain(
        &self,
        now: DateTime<Utc>,
        started: Instant,
        intent: &OrderIntent,
        split_allowed: bool,
    ) -> Result<ChainOutcome> {
        let mut meta = intent.meta_object();
        enrich_intent_envelope(&mut meta, self.cfg.runner.as_deref());
        let meta_value = Value::Object(meta.clone());

        let mut stages = Stages::default();

        // 1) Safety.
        let sv = self.safety.check_pre_trade(now, &meta_value).await?;
        stages.safety = Some(sv.clone());
        if !sv.ok {
            return Ok(ChainOutcome::Done(
                self.persist_reject(now, intent, meta, &stages, &sv).await?,
            ));
        }

        if let Some(out) = self.deadline_reject(now, started, intent, &meta, &stages).await? {
            return Ok(ChainOutcome::Done(out));
        }

        // 2) Market calendar.
        let cv = market_open_verdict(now, &meta_value, self.cfg.calendar_env_bypass);
        stages.calendar = Some(cv.clone());
        if !cv.ok {
            return Ok(ChainOutcome::Done(
                self.persist_reject(now, intent, meta, &stages, &cv).await?,
            ));
        }

        if let Some(out) = self.deadline_reject(now, started, intent, &meta, &stages).await? {
            return Ok(ChainOutcome::Done(out));
        }

        // 3) Exchange preflight.
        let pv = check_preflight(
            &intent.symbol,
            intent.side,
            intent.qty,
            &intent.order_type,
            intent.price,
            &meta_value,
            now,
        );
        stages.preflight = Some(pv.clone());
        if !pv.ok {
            let decision = decision_from_verdict(&self.policy, &pv.to_value(), &pv.reason);
            if split_allowed
                && decision.action == RejectAction::Split
                && pv.code == "EXEC_TAIFEX_MKT_QTY_LIMIT"
            {
                return Ok(ChainOutcome::Split {
                    stages,
                    meta,
                    preflight: pv,
                });
            }
            return Ok(ChainOutcome::Done(
                self.persist_reject_with_decision(now, intent, meta, &stages, &pv, decision)
                    .await?,
            ));
        }

        if let Some(out) = self.deadline_reject(now, started, intent, &meta, &stages).await? {
            return Ok(ChainOutcome::Done(out));
        }

        // 4) Risk.
        let rv = self
            .risk
            .check_pre_trade(
                now,
                &intent.symbol,
                intent.side.as_str(),
                intent.qty,
                intent.price.unwrap_or(0.0),
                &meta_value,
            )
            .await?;
        stages.risk = Some(rv.clone());
        if !rv.ok {
            return Ok(ChainOutcome::Done(
                self.persist_reject(now, intent, meta, &stages, &rv).await?,
            ));
        }

        // 5) Accept: delegate to the paper OMS.
        //    Preflight pass normally guarantees a canonical order type;
        //    a bypass flag can smuggle an unknown one through, which is
        //    still unsupported downstream.
        let Some(order_type) = OrderType::normalize(&intent.order_type) else {
            let v = Verdict::block(
                "ORDER_TYPE_UNSUPPORTED",
                format!("unsupported order type: {}", intent.order_type),
                json!({ "order_type": intent.order_type }),
            );
            return Ok(ChainOutcome::Done(
                self.persist_reject(now, intent, meta, &stages, &v).await?,
            ));
        };

        stages.write_into(&mut meta);
        meta.insert(
            "allow_decision".to_string(),
            json!({ "ok": true, "code": "OK", "action": "ALLOW" }),
        );

        let order = self
            .oms
            .submit_order(
                now,
                &intent.symbol,
                intent.side,
                intent.qty,
                order_type,
                intent.price,
                Value::Object(meta),
            )
            .await?;

        update_order_decision(
            self.oms.pool(),
            &order.broker_order_id,
            order.status.as_str(),
            "OK",
            "EXEC",
            "ALLOW",
            &order.meta,
        )
        .await?;

        info!(
            broker_order_id = %order.broker_order_id,
            symbol = %order.symbol,
            side = %order.side,
            qty = order.qty,
            "intent accepted"
        );

        Ok(ChainOutcome::Done(PlaceOutcome {
            ok: true,
            status: order.status,
            broker_order_id: Some(order.broker_order_id.clone()),
            exec_code: "OK".to_string(),
            safety: stages.safety,
            calendar: stages.calendar,
            preflight: stages.preflight,
            risk: stages.risk,
            reject: None,
            children: Vec::new(),
            order: Some(order),
        }))
    }

    async fn deadline_reject(
        &self,
        now: DateTime<Utc>,
        started: Instant,
        intent: &OrderIntent,
        meta: &Map<String, Value>,
        stages: &Stages,
    ) -> Result<Option<PlaceOutcome>> {
        let Some(deadline) = self.cfg.deadline else {
            return Ok(None);
        };
        if started.elapsed() <= deadline {
            return Ok(None);
        }
        let v = Verdict::block(
            "GATEWAY_DEADLINE_EXCEEDED",
            "intent deadline exceeded between gates",
            json!({
                "elapsed_ms": started.elapsed().as_millis() as i64,
                "deadline_ms": deadline.as_millis() as i64,
            }),
        );
        Ok(Some(
            self.persist_reject(now, intent, meta.clone(), stages, &v).await?,
        ))
    }

    // -----------------------------------------------------------------------
    // Reject persistence
    // -----------------------------------------------------------------------

    async fn persist_reject(
        &self,
        now: DateTime<Utc>,
        intent: &OrderIntent,
        meta: Map<String, Value>,
        stages: &Stages,
        failing: &Verdict,
    ) -> Result<PlaceOutcome> {
        let decision = decision_from_verdict(&self.policy, &failing.to_value(), &failing.reason);
        self.persist_reject_with_decision(now, intent, meta, stages, failing, decision)
            .await
    }

    async fn persist_reject_with_decision(
        &self,
        now: DateTime<Utc>,
        intent: &OrderIntent,
        mut meta: Map<String, Value>,
        stages: &Stages,
        failing: &Verdict,
        decision: RejectDecision,
    ) -> Result<PlaceOutcome> {
        stages.write_into(&mut meta);
        meta.insert("reject_decision".to_string(), decision.to_value());

        let broker_order_id = self
            .oms
            .persist_rejected_order(
                now,
                &intent.symbol,
                intent.side.as_str(),
                intent.qty,
                &intent.order_type,
                intent.price,
                failing,
                decision.domain.as_str(),
                decision.action.as_str(),
                Value::Object(meta),
            )
            .await?;

        // Policy side effects: the taxonomy may escalate a reject into a
        // durable cooldown or the kill switch.
        match decision.action {
            RejectAction::Cooldown => {
                self.safety
                    .request_cooldown(
                        now,
                        self.cfg.cooldown_on_reject_seconds,
                        &decision.code,
                        &decision.reason,
                        json!({ "broker_order_id": broker_order_id }),
                    )
                    .await?;
            }
            RejectAction::Kill => {
                self.safety
                    .request_kill(
                        now,
                        &decision.code,
                        &decision.reason,
                        json!({ "broker_order_id": broker_order_id }),
                    )
                    .await?;
            }
            _ => {}
        }

        warn!(
            broker_order_id = %broker_order_id,
            code = %decision.code,
            action = %decision.action,
            "intent rejected"
        );

        Ok(PlaceOutcome {
            ok: false,
            status: OrderStatus::Rejected,
            broker_order_id: Some(broker_order_id),
            exec_code: decision.code.clone(),
            safety: stages.safety.clone(),
            calendar: stages.calendar.clone(),
            preflight: stages.preflight.clone(),
            risk: stages.risk.clone(),
            reject: Some(decision),
            children: Vec::new(),
            order: None,
        })
    }

    // -----------------------------------------------------------------------
    // Split loop
    // -----------------------------------------------------------------------

    /// Finite-state split controller. Owns `remaining` and the current
    /// `cap`; risk tightening is the only mutation the cap accepts.
    async fn run_split_loop(
        &self,
        now: DateTime<Utc>,
        started: Instant,
        intent: &OrderIntent,
        stages: Stages,
        parent_meta: Map<String, Value>,
        preflight: Verdict,
    ) -> Result<PlaceOutcome> {
        let requested = intent.qty;
        let mut cap = preflight
            .details
            .get("split_plan")
            .and_then(|p| meta_f64(p, "child_qty"))
            .or_else(|| meta_f64(&preflight.details, "limit"))
            .unwrap_or(10.0);

        let parent_id = format!("SPLIT_{}", now.timestamp_millis());
        let mut children: Vec<String> = Vec::new();
        let mut remaining = requested;
        let mut submissions = 0usize;

        while remaining > 0.0 {
            // Hard ceiling counts every child submission, retries included.
            if submissions >= self.cfg.split_max_children {
                let v = Verdict::block(
                    "EXEC_SPLIT_LOOP_GUARD",
                    format!(
                        "split loop exceeded hard child ceiling {}",
                        self.cfg.split_max_children
                    ),
                    json!({
                        "split_parent_id": parent_id,
                        "submissions": submissions,
                        "remaining_qty": remaining,
                        "children_ok": children,
                    }),
                );
                return self
                    .persist_split_parent_reject(now, intent, &stages, &parent_meta, &preflight, parent_id, children, v, None)
                    .await;
            }

            let child_qty = cap.min(remaining);
            let mut child_meta = parent_meta.clone();
            child_meta.insert("split_parent_id".to_string(), json!(parent_id));
            child_meta.insert("split_index".to_string(), json!(children.len()));
            child_meta.insert("split_limit".to_string(), json!(cap));
            child_meta.insert("causation_id".to_string(), json!(parent_id));
            // Children carry fresh envelopes; drop the parent's.
            child_meta.remove("intent");

            let child_intent = OrderIntent {
                symbol: intent.symbol.clone(),
                side: intent.side,
                qty: child_qty,
                order_type: intent.order_type.clone(),
                price: intent.price,
                meta: Value::Object(child_meta),
            };

            submissions += 1;
            let out = match self.run_chain(now, started, &child_intent, false).await? {
                ChainOutcome::Done(out) => out,
                // Unreachable with split_allowed = false.
                ChainOutcome::Split { .. } => unreachable!("child chain cannot split"),
            };

            if out.ok {
                children.push(out.broker_order_id.unwrap_or_default());
                remaining -= child_qty;
                continue;
            }

            // Risk qty tightening: the one retry path. Only accepted when
            // the engine's cap is strictly below the current child size.
            if out.exec_code == "RISK_QTY_LIMIT" {
                let tightened = out
                    .risk
                    .as_ref()
                    .and_then(|r| meta_f64(&r.details, "max_qty_per_order"))
                    .map(f64::floor);
                if let Some(nc) = tightened {
                    if nc >= 1.0 && nc < child_qty {
                        cap = nc;
                        continue;
                    }
                }
            }

            // Any other reject terminates the split.
            let failing = Verdict::block(
                out.exec_code.clone(),
                format!("split child rejected: {}", out.exec_code),
                json!({ "child_broker_order_id": out.broker_order_id, "child_index": children.len() }),
            );
            return self
                .persist_split_parent_reject(
                    now, intent, &stages, &parent_meta, &preflight, parent_id, children, failing,
                    out.reject,
                )
                .await;
        }

        // Completed: one parent row referencing every child.
        let mut meta = parent_meta.clone();
        stages.write_into(&mut meta);
        meta.insert("preflight_verdict".to_string(), preflight.to_value());
        meta.insert("split_parent_id".to_string(), json!(parent_id));
        meta.insert("split_limit".to_string(), json!(cap));
        meta.insert("split_requested_qty".to_string(), json!(requested));
        meta.insert("split_children".to_string(), json!(children));

        insert_order(
            self.oms.pool(),
            &NewOrder {
                ts: clock::now_iso(now),
                broker_order_id: parent_id.clone(),
                symbol: intent.symbol.clone(),
                side: intent.side.as_str().to_string(),
                qty: requested,
                price: intent.price,
                order_type: intent.order_type.clone(),
                status: OrderStatus::SplitSubmitted.as_str().to_string(),
                verdict_code: Some("OK_SPLIT".to_string()),
                decision_domain: Some("EXEC".to_string()),
                decision_action: Some(RejectAction::Split.as_str().to_string()),
                meta: Value::Object(meta),
            },
        )
        .await?;

        info!(
            split_parent_id = %parent_id,
            children = children.len(),
            requested_qty = requested,
            "split completed"
        );

        Ok(PlaceOutcome {
            ok: true,
            status: OrderStatus::SplitSubmitted,
            broker_order_id: Some(parent_id),
            exec_code: "OK_SPLIT".to_string(),
            safety: stages.safety,
            calendar: stages.calendar,
            preflight: Some(preflight),
            risk: None,
            reject: None,
            children,
            order: None,
        })
    }

    /// Persist the parent row for an aborted split (REJECTED, with the
    /// children that did succeed recorded in the envelope).
    #[allow(clippy::too_many_arguments)]
    async fn persist_split_parent_reject(
        &self,
        now: DateTime<Utc>,
        intent: &OrderIntent,
        stages: &Stages,
        parent_meta: &Map<String, Value>,
        preflight: &Verdict,
        parent_id: String,
        children: Vec<String>,
        failing: Verdict,
        child_decision: Option<RejectDecision>,
    ) -> Result<PlaceOutcome> {
        let decision = child_decision
            .unwrap_or_else(|| decision_from_verdict(&self.policy, &failing.to_value(), &failing.reason));

        let mut meta = parent_meta.clone();
        stages.write_into(&mut meta);
        meta.insert("preflight_verdict".to_string(), preflight.to_value());
        meta.insert("split_parent_id".to_string(), json!(parent_id));
        meta.insert("split_children".to_string(), json!(children));
        meta.insert("reject_decision".to_string(), decision.to_value());

        insert_order(
            self.oms.pool(),
            &NewOrder {
                ts: clock::now_iso(now),
                broker_order_id: parent_id.clone(),
                symbol: intent.symbol.clone(),
                side: intent.side.as_str().to_string(),
                qty: intent.qty,
                price: intent.price,
                order_type: intent.order_type.clone(),
                status: OrderStatus::Rejected.as_str().to_string(),
                verdict_code: Some(failing.code.clone()),
                decision_domain: Some(decision.domain.as_str().to_string()),
                decision_action: Some(decision.action.as_str().to_string()),
                meta: Value::Object(meta),
            },
        )
        .await?;

        warn!(
            split_parent_id = %parent_id,
            code = %failing.code,
            children_ok = children.len(),
            "split aborted"
        );

        Ok(PlaceOutcome {
            ok: false,
            status: OrderStatus::Rejected,
            broker_order_id: Some(parent_id),
            exec_code: failing.code,
            safety: stages.safety.clone(),
            calendar: stages.calendar.clone(),
            preflight: Some(preflight.clone()),
            risk: stages.risk.clone(),
            reject: Some(decision),
            children,
            order: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Envelope enrichment
// ---------------------------------------------------------------------------

/// Build/refresh `meta.intent`. Generates a correlation id when absent and
/// fills provenance from the flat meta keys; never mutates other caller
/// fields.
fn enrich_intent_envelope(meta: &mut Map<String, Value>, runner: Option<&str>) -> IntentEnvelope {
    let mut env: IntentEnvelope = meta
        .get("intent")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();

    let str_key = |meta: &Map<String, Value>, key: &str| {
        meta.get(key).and_then(|v| v.as_str()).map(str::to_string)
    };

    if env.correlation_id.is_empty() {
        env.correlation_id = str_key(meta, "correlation_id")
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    }
    if env.causation_id.is_none() {
        env.causation_id = str_key(meta, "causation_id");
    }
    if env.strategy_id.is_none() {
        env.strategy_id = str_key(meta, "strategy_id");
    }
    if env.signal_id.is_none() {
        env.signal_id = str_key(meta, "signal_id");
    }
    if env.runner.is_none() {
        env.runner = runner.map(str::to_string);
    }
    if env.source_file.is_none() {
        env.source_file = str_key(meta, "source_file");
    }
    if env.stop.is_none() {
        let stop = match meta.get("stop_price") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        if let Some(stop_price) = stop {
            env.stop = Some(StopSpec { stop_price });
        }
    }

    meta.insert(
        "intent".to_string(),
        serde_json::to_value(&env).unwrap_or(Value::Null),
    );
    env
}

// ---------------------------------------------------------------------------
// Unit tests (pure parts; chain scenarios live in tests/)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_generates_correlation_and_reads_provenance() {
        let mut meta = Map::new();
        meta.insert("strategy_id".to_string(), json!("trend_v1"));
        meta.insert("stop_price".to_string(), json!(19900.0));

        let env = enrich_intent_envelope(&mut meta, Some("paper_runner"));
        assert!(!env.correlation_id.is_empty());
        assert_eq!(env.strategy_id.as_deref(), Some("trend_v1"));
        assert_eq!(env.runner.as_deref(), Some("paper_runner"));
        assert_eq!(env.stop.unwrap().stop_price, 19900.0);

        // Written back under meta.intent.
        assert_eq!(meta["intent"]["strategy_id"], "trend_v1");
        // Caller keys untouched.
        assert_eq!(meta["strategy_id"], "trend_v1");
    }

    #[test]
    fn envelope_preserves_existing_correlation() {
        let mut meta = Map::new();
        meta.insert("intent".to_string(), json!({ "correlation_id": "corr-1" }));
        let env = enrich_intent_envelope(&mut meta, None);
        assert_eq!(env.correlation_id, "corr-1");
    }
}
