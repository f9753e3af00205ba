//! Reject taxonomy.
//!
//! Normalizes reject reasons across the safety/exec/risk layers into one
//! deterministic decision: `{code, domain, severity, action}`. The action
//! comes from a policy mapping with three levels of specificity
//! (`by_code`, then `by_prefix`, then `by_domain`); a miss defaults to
//! REJECT with the domain's default severity.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use twf_schemas::{DecisionDomain, RejectAction, Severity};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// One policy row; absent fields fall back to defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

/// Policy mapping loaded from JSON (`by_code` / `by_prefix` / `by_domain`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RejectPolicy {
    #[serde(default)]
    pub by_code: BTreeMap<String, PolicyRow>,
    #[serde(default)]
    pub by_prefix: BTreeMap<String, PolicyRow>,
    #[serde(default)]
    pub by_domain: BTreeMap<String, PolicyRow>,
}

impl RejectPolicy {
    /// Load a policy file. The root must be a JSON object.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read reject policy {path:?}"))?;
        let value: Value = serde_json::from_str(&text)
            .with_context(|| format!("parse reject policy {path:?}"))?;
        if !value.is_object() {
            bail!("reject_policy root must be object: {path:?}");
        }
        serde_json::from_value(value).with_context(|| format!("decode reject policy {path:?}"))
    }

    /// Built-in policy: market-qty overflows split; everything else takes
    /// the domain defaults.
    pub fn builtin() -> Self {
        let mut by_code = BTreeMap::new();
        by_code.insert(
            "EXEC_TAIFEX_MKT_QTY_LIMIT".to_string(),
            PolicyRow {
                action: Some("SPLIT".to_string()),
                severity: Some("MED".to_string()),
            },
        );
        Self {
            by_code,
            ..Default::default()
        }
    }

    /// Resolve `(action, severity)` for a verdict code:
    /// `by_code` -> `by_prefix` -> `by_domain` -> `(REJECT, domain default)`.
    pub fn decide_action(&self, code: &str) -> (RejectAction, Severity) {
        let code = code.to_ascii_uppercase();
        let domain = DecisionDomain::from_code(&code);

        if let Some(row) = self.by_code.get(&code) {
            return resolve_row(row, domain);
        }

        for (prefix, row) in &self.by_prefix {
            if code.starts_with(&prefix.to_ascii_uppercase()) {
                return resolve_row(row, domain);
            }
        }

        if let Some(row) = self.by_domain.get(domain.as_str()) {
            return resolve_row(row, domain);
        }

        (RejectAction::Reject, Severity::default_for(domain))
    }
}

fn resolve_row(row: &PolicyRow, domain: DecisionDomain) -> (RejectAction, Severity) {
    let action = row
        .action
        .as_deref()
        .and_then(RejectAction::parse)
        .unwrap_or(RejectAction::Reject);
    let severity = row
        .severity
        .as_deref()
        .and_then(Severity::parse)
        .unwrap_or_else(|| Severity::default_for(domain));
    (action, severity)
}

// ---------------------------------------------------------------------------
// RejectDecision
// ---------------------------------------------------------------------------

/// The taxonomy's output, persisted as `meta.reject_decision`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RejectDecision {
    pub ok: bool,
    pub code: String,
    pub domain: DecisionDomain,
    pub severity: Severity,
    pub action: RejectAction,
    pub reason: String,
    pub details: Value,
}

impl RejectDecision {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Build a decision from a verdict-shaped JSON value.
///
/// Accepts the sealed verdict shape (`{ok, code, reason, details}`) plus
/// the legacy wrappers `{risk: {...}}` / `{safety: {...}}`, which are
/// unwrapped deterministically (risk first, then safety).
pub fn decision_from_verdict(
    policy: &RejectPolicy,
    verdict: &Value,
    reason_fallback: &str,
) -> RejectDecision {
    let v = unwrap_verdict(verdict);

    let ok = v.get("ok").and_then(|b| b.as_bool()).unwrap_or(false);
    let code = v
        .get("code")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| if ok { "OK".to_string() } else { "UNKNOWN".to_string() });
    let reason = v
        .get("reason")
        .and_then(|r| r.as_str())
        .filter(|r| !r.is_empty())
        .unwrap_or(reason_fallback)
        .to_string();
    let details = v.get("details").cloned().unwrap_or(Value::Null);

    if ok {
        return RejectDecision {
            ok: true,
            code: "OK".to_string(),
            domain: DecisionDomain::Unknown,
            severity: Severity::Low,
            action: RejectAction::Allow,
            reason: "pass".to_string(),
            details: json!({ "verdict": verdict }),
        };
    }

    let domain = DecisionDomain::from_code(&code);
    let (action, severity) = policy.decide_action(&code);

    RejectDecision {
        ok: false,
        code,
        domain,
        severity,
        action,
        reason,
        details: json!({ "details": details, "verdict": verdict }),
    }
}

fn unwrap_verdict(verdict: &Value) -> &Value {
    let mut v = verdict;
    if let Some(inner) = v.get("risk").filter(|i| i.is_object()) {
        v = inner;
    }
    if let Some(inner) = v.get("safety").filter(|i| i.is_object()) {
        v = inner;
    }
    v
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_policy_splits_market_qty_limit() {
        let p = RejectPolicy::builtin();
        let (action, severity) = p.decide_action("EXEC_TAIFEX_MKT_QTY_LIMIT");
        assert_eq!(action, RejectAction::Split);
        assert_eq!(severity, Severity::Med);
    }

    #[test]
    fn lookup_order_code_prefix_domain_default() {
        let policy: RejectPolicy = serde_json::from_value(json!({
            "by_code": { "RISK_QTY_LIMIT": { "action": "RETRY", "severity": "LOW" } },
            "by_prefix": { "SAFETY_": { "action": "COOLDOWN" } },
            "by_domain": { "EXEC": { "action": "REJECT", "severity": "HIGH" } },
        }))
        .unwrap();

        assert_eq!(
            policy.decide_action("RISK_QTY_LIMIT"),
            (RejectAction::Retry, Severity::Low)
        );
        // Prefix row without severity keeps the SAFETY default (HIGH).
        assert_eq!(
            policy.decide_action("SAFETY_FEED_STALE"),
            (RejectAction::Cooldown, Severity::High)
        );
        assert_eq!(
            policy.decide_action("EXEC_MARKET_CLOSED"),
            (RejectAction::Reject, Severity::High)
        );
        // Full miss: REJECT + domain default.
        assert_eq!(
            policy.decide_action("RISK_STOP_REQUIRED"),
            (RejectAction::Reject, Severity::Med)
        );
        assert_eq!(
            policy.decide_action("SOMETHING_ELSE"),
            (RejectAction::Reject, Severity::Low)
        );
    }

    #[test]
    fn decision_from_plain_verdict() {
        let policy = RejectPolicy::builtin();
        let verdict = json!({
            "ok": false,
            "code": "SAFETY_FEED_STALE",
            "reason": "stale",
            "details": { "age_seconds": 60.0 },
        });
        let d = decision_from_verdict(&policy, &verdict, "");
        assert!(!d.ok);
        assert_eq!(d.code, "SAFETY_FEED_STALE");
        assert_eq!(d.domain, DecisionDomain::Safety);
        assert_eq!(d.severity, Severity::High);
        assert_eq!(d.action, RejectAction::Reject);
        assert_eq!(d.details["details"]["age_seconds"], 60.0);
    }

    #[test]
    fn decision_unwraps_nested_shapes() {
        let policy = RejectPolicy::builtin();
        let wrapped = json!({
            "risk": { "ok": false, "code": "RISK_STOP_REQUIRED", "reason": "no stop" },
        });
        let d = decision_from_verdict(&policy, &wrapped, "");
        assert_eq!(d.code, "RISK_STOP_REQUIRED");
        assert_eq!(d.domain, DecisionDomain::Risk);

        let safety_wrapped = json!({
            "safety": { "ok": false, "code": "SAFETY_KILL_SWITCH", "reason": "kill" },
        });
        let d2 = decision_from_verdict(&policy, &safety_wrapped, "");
        assert_eq!(d2.code, "SAFETY_KILL_SWITCH");
    }

    #[test]
    fn ok_verdict_becomes_allow() {
        let policy = RejectPolicy::builtin();
        let d = decision_from_verdict(&policy, &json!({"ok": true, "code": "OK"}), "");
        assert!(d.ok);
        assert_eq!(d.action, RejectAction::Allow);
        assert_eq!(d.code, "OK");
    }

    #[test]
    fn policy_file_root_must_be_object() {
        let dir = std::env::temp_dir();
        let path = dir.join("twf_test_policy_array.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        let err = RejectPolicy::load(&path).unwrap_err();
        assert!(err.to_string().contains("root must be object"));
        std::fs::remove_file(&path).ok();
    }
}
