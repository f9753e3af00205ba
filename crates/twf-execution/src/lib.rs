//! twf-execution
//!
//! The pre-trade decision pipeline: exchange preflight, reject taxonomy,
//! and the order gateway that chains Safety -> Calendar -> Preflight ->
//! Risk -> Paper OMS, persisting a verdict envelope for every outcome.

pub mod gateway;
pub mod preflight;
pub mod taxonomy;

pub use gateway::{GatewayConfig, OrderGateway, PlaceOutcome};
pub use preflight::{check_preflight, market_qty_limit, session_hint, SessionKind, LIMIT_QTY_CAP};
pub use taxonomy::{decision_from_verdict, PolicyRow, RejectDecision, RejectPolicy};
