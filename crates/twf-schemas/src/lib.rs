//! Shared domain vocabulary for the paper trading core.
//!
//! Everything that crosses a crate boundary lives here: order sides and
//! lifecycle statuses, the sealed [`Verdict`] record every gate returns,
//! the reject-decision dimensions (domain / action / severity), event
//! payload schemas and the intent envelope.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod events;
pub mod intent;

pub use events::{Bar, BookPayload, TickPayload};
pub use intent::{IntentEnvelope, OrderIntent, StopSpec};

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Order side. Wire form is `"BUY"` / `"SELL"`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" | "B" => Some(Side::Buy),
            "SELL" | "S" => Some(Side::Sell),
            _ => None,
        }
    }

    /// +1 for BUY, -1 for SELL (signed fill quantity).
    pub fn sign(&self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OrderType
// ---------------------------------------------------------------------------

/// Canonical TAIFEX order types. `MWP` is market-with-protection: it
/// converts to a limit anchored at the same-side best price.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Mwp,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::Mwp => "MWP",
        }
    }

    /// Normalize caller spellings (`MKT`, `LMT`, `MKP`) to the canonical
    /// type. Returns `None` for anything else; preflight turns that into
    /// `ORDER_TYPE_UNSUPPORTED` rather than guessing.
    pub fn normalize(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "MARKET" | "MKT" => Some(OrderType::Market),
            "LIMIT" | "LMT" => Some(OrderType::Limit),
            "MWP" | "MKP" => Some(OrderType::Mwp),
            _ => None,
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OrderStatus
// ---------------------------------------------------------------------------

/// Order lifecycle status. Monotonic: once terminal, never rewritten.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    /// Parent row of a completed split; children carry the real fills.
    SplitSubmitted,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::SplitSubmitted => "SPLIT_SUBMITTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(OrderStatus::New),
            "SUBMITTED" => Some(OrderStatus::Submitted),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "SPLIT_SUBMITTED" => Some(OrderStatus::SplitSubmitted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::SplitSubmitted
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TradeDirection
// ---------------------------------------------------------------------------

/// Direction of an open/closed round-trip trade.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeDirection {
    Long,
    Short,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Long => "LONG",
            TradeDirection::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LONG" => Some(TradeDirection::Long),
            "SHORT" => Some(TradeDirection::Short),
            _ => None,
        }
    }

    /// +1 for LONG, -1 for SHORT (pnl sign).
    pub fn sign(&self) -> f64 {
        match self {
            TradeDirection::Long => 1.0,
            TradeDirection::Short => -1.0,
        }
    }
}

impl fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Sealed verdict record returned by every gate (safety, calendar,
/// preflight, risk).
///
/// `ok == true` still carries a `code` (`"OK"`, or an explicit allow code
/// such as `OK_DEV_ALLOW_STALE`) so audit rows always explain themselves.
/// `details` is an opaque JSON object with gate-specific evidence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub ok: bool,
    pub code: String,
    pub reason: String,
    #[serde(default)]
    pub details: Value,
}

impl Verdict {
    pub fn pass() -> Self {
        Self::pass_with("OK", "pass", Value::Null)
    }

    pub fn pass_with(code: impl Into<String>, reason: impl Into<String>, details: Value) -> Self {
        Self {
            ok: true,
            code: code.into(),
            reason: reason.into(),
            details,
        }
    }

    pub fn block(code: impl Into<String>, reason: impl Into<String>, details: Value) -> Self {
        Self {
            ok: false,
            code: code.into(),
            reason: reason.into(),
            details,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Reject-decision dimensions
// ---------------------------------------------------------------------------

/// Which layer a verdict code belongs to, inferred from its prefix.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionDomain {
    Safety,
    Exec,
    Risk,
    Broker,
    Unknown,
}

impl DecisionDomain {
    pub fn from_code(code: &str) -> Self {
        let c = code.to_ascii_uppercase();
        if c.starts_with("RISK_") {
            DecisionDomain::Risk
        } else if c.starts_with("SAFETY_") {
            DecisionDomain::Safety
        } else if c.starts_with("EXEC_") {
            DecisionDomain::Exec
        } else if c.starts_with("BROKER_") {
            DecisionDomain::Broker
        } else {
            DecisionDomain::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionDomain::Safety => "SAFETY",
            DecisionDomain::Exec => "EXEC",
            DecisionDomain::Risk => "RISK",
            DecisionDomain::Broker => "BROKER",
            DecisionDomain::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for DecisionDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy action attached to a reject (or ALLOW for a pass).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RejectAction {
    Allow,
    Reject,
    Retry,
    Cooldown,
    Kill,
    Split,
}

impl RejectAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectAction::Allow => "ALLOW",
            RejectAction::Reject => "REJECT",
            RejectAction::Retry => "RETRY",
            RejectAction::Cooldown => "COOLDOWN",
            RejectAction::Kill => "KILL",
            RejectAction::Split => "SPLIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALLOW" => Some(RejectAction::Allow),
            "REJECT" => Some(RejectAction::Reject),
            "RETRY" => Some(RejectAction::Retry),
            "COOLDOWN" => Some(RejectAction::Cooldown),
            "KILL" => Some(RejectAction::Kill),
            "SPLIT" => Some(RejectAction::Split),
            _ => None,
        }
    }
}

impl fmt::Display for RejectAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to a reject decision.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Med,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Med => "MED",
            Severity::High => "HIGH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Some(Severity::Low),
            "MED" | "MEDIUM" => Some(Severity::Med),
            "HIGH" => Some(Severity::High),
            _ => None,
        }
    }

    /// Conservative default per domain when the policy has no row.
    pub fn default_for(domain: DecisionDomain) -> Self {
        match domain {
            DecisionDomain::Safety => Severity::High,
            DecisionDomain::Risk | DecisionDomain::Exec | DecisionDomain::Broker => Severity::Med,
            DecisionDomain::Unknown => Severity::Low,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
