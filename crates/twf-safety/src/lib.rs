//! twf-safety
//!
//! System safety gates. Two layers live here:
//!
//! - [`SafetyEngine`]: kill-switch, cooldown, halt-day, session-window and
//!   feed-staleness gates, evaluated against the store before any intent
//!   reaches risk. Cooldown and kill are durable (`safety_state` table), so
//!   they survive restarts and are cleared only by their explicit mutators.
//! - [`calendar`]: the market-calendar gate (weekend / holiday / session
//!   break) with its override knobs.

pub mod calendar;
pub mod engine;

pub use calendar::market_open_verdict;
pub use engine::{SafetyConfig, SafetyEngine};
