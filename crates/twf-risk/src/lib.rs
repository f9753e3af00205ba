//! twf-risk
//!
//! Pre-trade risk engine. Pure short-circuit evaluation: gates run in a
//! fixed order and the first failure decides the verdict. State the engine
//! needs (today's realized pnl, recent closed trades) is read from the
//! store at evaluation time, never cached across intents.

mod engine;

pub use engine::{RiskConfig, RiskEngine};
