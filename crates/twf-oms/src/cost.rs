//! Cost model for TAIFEX index futures.
//!
//! Components: per-side transaction tax on notional (equity index futures
//! rate), plus per-contract per-side exchange/clearing/broker fees. The
//! paper OMS applies per-side costs on every fill; reporting uses the
//! round-trip total (open + close).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Taiwan futures transaction tax for equity index futures, per side.
pub const TAX_RATE_EQUITY_FUTURES: f64 = 0.00002; // 2 / 100000

// ---------------------------------------------------------------------------
// FeeSpec
// ---------------------------------------------------------------------------

/// NTD per contract per side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeeSpec {
    pub exchange_fee: f64,
    pub clearing_fee: f64,
    pub broker_commission: f64,
}

impl FeeSpec {
    pub fn per_side_total(&self) -> f64 {
        self.exchange_fee + self.clearing_fee + self.broker_commission
    }
}

// ---------------------------------------------------------------------------
// CostError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CostError {
    /// No multiplier is known for the symbol (`UNKNOWN_SYMBOL`).
    UnknownSymbol { symbol: String },
}

impl fmt::Display for CostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CostError::UnknownSymbol { symbol } => {
                write!(f, "UNKNOWN_SYMBOL: no contract multiplier for {symbol}")
            }
        }
    }
}

impl std::error::Error for CostError {}

// ---------------------------------------------------------------------------
// CostModel
// ---------------------------------------------------------------------------

/// Round-trip cost breakdown, NTD.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundTripCost {
    pub notional: f64,
    pub tax_round_trip: f64,
    pub fee_round_trip: f64,
    pub total: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// NTD per point per contract (contract multiplier).
    pub multiplier_by_symbol: BTreeMap<String, f64>,
    pub fee_by_symbol: BTreeMap<String, FeeSpec>,
    pub tax_rate: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        let mut multiplier_by_symbol = BTreeMap::new();
        multiplier_by_symbol.insert("TMF".to_string(), 10.0);
        multiplier_by_symbol.insert("MXF".to_string(), 50.0);
        multiplier_by_symbol.insert("TXF".to_string(), 200.0);

        let mut fee_by_symbol = BTreeMap::new();
        // Exchange 4.8 + clearing 3.2 per side for the micro contract;
        // larger contracts left at zero until broker terms are configured.
        fee_by_symbol.insert(
            "TMF".to_string(),
            FeeSpec {
                exchange_fee: 4.8,
                clearing_fee: 3.2,
                broker_commission: 0.0,
            },
        );
        fee_by_symbol.insert("MXF".to_string(), FeeSpec::default());
        fee_by_symbol.insert("TXF".to_string(), FeeSpec::default());

        Self {
            multiplier_by_symbol,
            fee_by_symbol,
            tax_rate: TAX_RATE_EQUITY_FUTURES,
        }
    }
}

impl CostModel {
    /// Root symbol: broker aliases first (TX, MTX), then prefix match so
    /// rolling codes (TMFB6) resolve to their contract family.
    pub fn base_symbol<'a>(&self, symbol: &'a str) -> &'a str {
        match symbol {
            "TX" => "TXF",
            "MTX" => "MXF",
            _ => {
                for prefix in self.multiplier_by_symbol.keys() {
                    if symbol.starts_with(prefix.as_str()) {
                        return &symbol[..prefix.len()];
                    }
                }
                symbol
            }
        }
    }

    pub fn multiplier(&self, symbol: &str) -> Result<f64, CostError> {
        let base = self.base_symbol(symbol);
        match self.multiplier_by_symbol.get(base) {
            Some(m) if *m > 0.0 => Ok(*m),
            _ => Err(CostError::UnknownSymbol {
                symbol: symbol.to_string(),
            }),
        }
    }

    /// `price * multiplier * qty`, NTD.
    pub fn contract_notional(&self, price: f64, symbol: &str, qty: f64) -> Result<f64, CostError> {
        let m = self.multiplier(symbol)?;
        Ok(price * m * qty)
    }

    pub fn fee_spec(&self, symbol: &str) -> FeeSpec {
        self.fee_by_symbol
            .get(self.base_symbol(symbol))
            .copied()
            .unwrap_or_default()
    }

    /// One side's (fee, tax) for a fill.
    ///
    /// Unknown symbols fall back to multiplier 1.0 here: a fill that is
    /// already happening must book its costs rather than abort.
    pub fn per_side_cost(&self, symbol: &str, price: f64, qty: f64) -> (f64, f64) {
        let mult = self.multiplier(symbol).unwrap_or(1.0);
        let notional = price * mult * qty;
        let tax = notional * self.tax_rate;
        let fee = self.fee_spec(symbol).per_side_total() * qty;
        (fee, tax)
    }

    /// Round trip = open + close: `2*(fee_per_side*qty) + 2*(notional*tax)`.
    pub fn round_trip_cost(
        &self,
        symbol: &str,
        price: f64,
        qty: f64,
    ) -> Result<RoundTripCost, CostError> {
        let notional = self.contract_notional(price, symbol, qty)?;
        let tax_round_trip = notional * self.tax_rate * 2.0;
        let fee_round_trip = self.fee_spec(symbol).per_side_total() * qty * 2.0;
        Ok(RoundTripCost {
            notional,
            tax_round_trip,
            fee_round_trip,
            total: tax_round_trip + fee_round_trip,
        })
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
