//! Pre-trade system safety engine.
//!
//! Gate order (first failure wins):
//!
//! 1. kill-switch engaged        -> `SAFETY_KILL_SWITCH`
//! 2. cooldown active            -> `SAFETY_COOLDOWN_ACTIVE`
//! 3. halt day                   -> `SAFETY_HALT_DAY`
//! 4. outside required session   -> `SAFETY_SESSION_CLOSED`
//! 5. no qualifying book event   -> `SAFETY_BIDASK_MISSING`
//! 6. unparsable event timestamp -> `SAFETY_BIDASK_TS_INVALID`
//! 7. feed older than threshold  -> `SAFETY_FEED_STALE`
//!
//! The only truth source for feed freshness is the event log; freshness
//! prefers the payload's `recv_ts`/`ingest_ts` over the outer event ts
//! (recorder-side vs. exchange-side clocks).

use anyhow::Result;
use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Asia::Taipei;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::warn;

use twf_schemas::intent::meta_f64;
use twf_schemas::Verdict;
use twf_store::{clock, latest_event_by_kind, safety_state_get, safety_state_set, DEFAULT_SCAN_LIMIT};

pub const STATE_KEY_COOLDOWN: &str = "cooldown";
pub const STATE_KEY_KILL: &str = "kill";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Enforce the feed-freshness gate at all.
    pub require_recent_bidask: bool,
    /// Event kind to scan for the book truth source.
    pub bidask_kind: String,
    /// Exclude synthetic events from the freshness source.
    pub reject_synthetic_bidask: bool,
    /// Contract code looked up in the event payloads.
    pub fop_code: String,
    /// Staleness threshold in seconds.
    pub max_bidask_age_seconds: f64,
    /// Enforce the session-window gate.
    pub require_session_open: bool,
    /// Session open, `HHMM` Taipei local.
    pub session_open_hhmm: String,
    /// Session close, `HHMM` Taipei local.
    pub session_close_hhmm: String,
    /// Comma-separated YYYY-MM-DD halt days (expiry/settlement/maintenance).
    pub halt_dates_csv: String,
    /// Dev override: accept a stale feed. HARDGUARD: ignored whenever the
    /// current time is inside the configured session window, so the
    /// override can never enable stale trading in-session.
    pub dev_allow_stale: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            require_recent_bidask: true,
            bidask_kind: twf_schemas::events::KIND_BIDASK_FOP.to_string(),
            reject_synthetic_bidask: true,
            fop_code: "TMFB6".to_string(),
            // Dev-safe default (6h); live configs tighten this to seconds.
            max_bidask_age_seconds: 6.0 * 60.0 * 60.0,
            require_session_open: false,
            session_open_hhmm: "0845".to_string(),
            session_close_hhmm: "1345".to_string(),
            halt_dates_csv: String::new(),
            dev_allow_stale: false,
        }
    }
}

impl SafetyConfig {
    /// Build from the enumerated env knobs, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = twf_config::env_str(twf_config::ENV_FOP_CODE) {
            cfg.fop_code = v;
        }
        cfg.max_bidask_age_seconds = twf_config::env_f64(
            twf_config::ENV_MAX_BIDASK_AGE_SECONDS,
            cfg.max_bidask_age_seconds,
        );
        cfg.require_session_open = twf_config::env_truthy(
            twf_config::ENV_REQUIRE_SESSION_OPEN,
            cfg.require_session_open,
        );
        if let Some(v) = twf_config::env_str(twf_config::ENV_SESSION_OPEN_HHMM) {
            cfg.session_open_hhmm = v;
        }
        if let Some(v) = twf_config::env_str(twf_config::ENV_SESSION_CLOSE_HHMM) {
            cfg.session_close_hhmm = v;
        }
        if let Some(v) = twf_config::env_str(twf_config::ENV_HALT_DATES) {
            cfg.halt_dates_csv = v;
        }
        cfg.dev_allow_stale = twf_config::env_truthy(
            twf_config::ENV_DEV_ALLOW_STALE_BIDASK,
            cfg.dev_allow_stale,
        );
        cfg
    }

    /// True when `now` falls inside the configured session window
    /// (inclusive on both ends), on the Taipei clock.
    pub fn in_session(&self, now: DateTime<Utc>) -> bool {
        let open = parse_hhmm(&self.session_open_hhmm);
        let close = parse_hhmm(&self.session_close_hhmm);
        let t = now.with_timezone(&Taipei).time();
        t >= open && t <= close
    }

    fn is_halt_day(&self, now: DateTime<Utc>) -> bool {
        if self.halt_dates_csv.trim().is_empty() {
            return false;
        }
        let day = clock::taipei_day(now);
        self.halt_dates_csv
            .split(',')
            .map(str::trim)
            .any(|d| !d.is_empty() && d == day)
    }
}

/// `"0845"` -> 08:45. Malformed input reads as midnight, matching the
/// permissive knob handling elsewhere.
fn parse_hhmm(s: &str) -> NaiveTime {
    let s = s.trim();
    if s.len() == 4 && s.chars().all(|c| c.is_ascii_digit()) {
        let h: u32 = s[..2].parse().unwrap_or(0);
        let m: u32 = s[2..].parse().unwrap_or(0);
        if let Some(t) = NaiveTime::from_hms_opt(h, m, 0) {
            return t;
        }
    }
    NaiveTime::from_hms_opt(0, 0, 0).unwrap()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SafetyEngine {
    pool: SqlitePool,
    cfg: SafetyConfig,
}

impl SafetyEngine {
    pub fn new(pool: SqlitePool, cfg: SafetyConfig) -> Self {
        Self { pool, cfg }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.cfg
    }

    /// Evaluate every safety gate for one intent.
    ///
    /// Business outcomes are verdict values; only store faults surface as
    /// errors.
    pub async fn check_pre_trade(&self, now: DateTime<Utc>, meta: &Value) -> Result<Verdict> {
        let cfg = &self.cfg;

        // 1) Kill-switch: sticky until explicitly cleared.
        let kill = safety_state_get(&self.pool, STATE_KEY_KILL).await?;
        if let Some(st) = &kill {
            if st.get("enabled").and_then(|v| v.as_bool()) == Some(true) {
                return Ok(Verdict::block(
                    "SAFETY_KILL_SWITCH",
                    "kill-switch enabled; trading blocked",
                    json!({ "kill": st }),
                ));
            }
        }

        // 2) Cooldown: `until_epoch == 0` means cleared.
        let cooldown = safety_state_get(&self.pool, STATE_KEY_COOLDOWN).await?;
        if let Some(st) = &cooldown {
            let until = st.get("until_epoch").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let now_epoch = now.timestamp_millis() as f64 / 1000.0;
            if until > now_epoch {
                return Ok(Verdict::block(
                    "SAFETY_COOLDOWN_ACTIVE",
                    "cooldown active; trading blocked temporarily",
                    json!({ "cooldown": st, "now_epoch": now_epoch }),
                ));
            }
        }

        // 3) Manual halt day (expiry/settlement/maintenance).
        if cfg.is_halt_day(now) {
            return Ok(Verdict::block(
                "SAFETY_HALT_DAY",
                "today is configured as a halt/expiry/maintenance day; trading blocked",
                json!({
                    "today": clock::taipei_day(now),
                    "halt_dates_csv": cfg.halt_dates_csv,
                }),
            ));
        }

        // 4) Session guard (optional).
        if cfg.require_session_open && !cfg.in_session(now) {
            return Ok(Verdict::block(
                "SAFETY_SESSION_CLOSED",
                "session guard active and current time is outside session window",
                json!({
                    "open_hhmm": cfg.session_open_hhmm,
                    "close_hhmm": cfg.session_close_hhmm,
                }),
            ));
        }

        // 5-7) Feed staleness from the event log.
        if cfg.require_recent_bidask {
            let reject_synthetic = cfg.reject_synthetic_bidask;
            let code = cfg.fop_code.clone();
            let ev = latest_event_by_kind(&self.pool, &cfg.bidask_kind, DEFAULT_SCAN_LIMIT, |e| {
                if e.payload.get("code").and_then(|c| c.as_str()) != Some(code.as_str()) {
                    return false;
                }
                if reject_synthetic
                    && e.payload.get("synthetic").and_then(|s| s.as_bool()) == Some(true)
                {
                    return false;
                }
                true
            })
            .await?;

            let Some(ev) = ev else {
                return Ok(Verdict::block(
                    "SAFETY_BIDASK_MISSING",
                    "no bidask event found in DB for required fop_code",
                    json!({ "bidask_kind": cfg.bidask_kind, "fop_code": cfg.fop_code }),
                ));
            };

            let ts_used = ev
                .payload
                .get("recv_ts")
                .and_then(|v| v.as_str())
                .or_else(|| ev.payload.get("ingest_ts").and_then(|v| v.as_str()))
                .unwrap_or(&ev.ts)
                .to_string();

            let Some(age) = clock::age_seconds(&ts_used, now) else {
                return Ok(Verdict::block(
                    "SAFETY_BIDASK_TS_INVALID",
                    "cannot parse bidask event ts",
                    json!({ "bidask_event_id": ev.id, "ts": ev.ts, "ts_used": ts_used }),
                ));
            };

            // Threshold: caller meta may tighten/relax for one intent.
            let max_age = meta_f64(meta, "max_bidask_age_seconds")
                .unwrap_or(cfg.max_bidask_age_seconds);

            if age > max_age {
                // HARDGUARD: the dev override never applies in-session.
                let allow_stale = cfg.dev_allow_stale && !cfg.in_session(now);
                let details = json!({
                    "bidask_event_id": ev.id,
                    "bidask_ts": ev.ts,
                    "age_seconds": age,
                    "max_bidask_age_seconds": max_age,
                    "ts_used": ts_used,
                    "fop_code": cfg.fop_code,
                });
                if allow_stale {
                    warn!(age_seconds = age, "stale bidask accepted by dev override");
                    return Ok(Verdict::pass_with(
                        "OK_DEV_ALLOW_STALE",
                        format!(
                            "bidask feed stale but allowed by dev override: age_sec={age:.1} > max={max_age}"
                        ),
                        details,
                    ));
                }
                return Ok(Verdict::block(
                    "SAFETY_FEED_STALE",
                    format!("bidask feed stale: age_sec={age:.1} > max={max_age}"),
                    details,
                ));
            }
        }

        Ok(Verdict::pass_with(
            "OK",
            "system safety pre-trade pass",
            json!({ "cfg": cfg }),
        ))
    }

    // -----------------------------------------------------------------------
    // Durable state mutators
    // -----------------------------------------------------------------------

    /// Start (or clear) a cooldown.
    ///
    /// `seconds <= 0` is an explicit clear: the row is rewritten with
    /// `until_epoch = 0`, never coerced up to one second. That distinction
    /// matters because operators and smoke flows use zero to reset.
    pub async fn request_cooldown(
        &self,
        now: DateTime<Utc>,
        seconds: i64,
        code: &str,
        reason: &str,
        details: Value,
    ) -> Result<()> {
        let until = if seconds <= 0 {
            0.0
        } else {
            now.timestamp_millis() as f64 / 1000.0 + seconds as f64
        };
        let value = json!({
            "until_epoch": until,
            "code": code,
            "reason": reason,
            "details": details,
        });
        safety_state_set(&self.pool, STATE_KEY_COOLDOWN, &value, &clock::now_iso(now)).await?;
        Ok(())
    }

    /// Engage the kill switch; stays until [`clear_kill`](Self::clear_kill).
    pub async fn request_kill(
        &self,
        now: DateTime<Utc>,
        code: &str,
        reason: &str,
        details: Value,
    ) -> Result<()> {
        let value = json!({
            "enabled": true,
            "code": code,
            "reason": reason,
            "details": details,
        });
        safety_state_set(&self.pool, STATE_KEY_KILL, &value, &clock::now_iso(now)).await?;
        Ok(())
    }

    pub async fn clear_cooldown(&self, now: DateTime<Utc>) -> Result<()> {
        safety_state_set(
            &self.pool,
            STATE_KEY_COOLDOWN,
            &json!({ "until_epoch": 0 }),
            &clock::now_iso(now),
        )
        .await?;
        Ok(())
    }

    pub async fn clear_kill(&self, now: DateTime<Utc>) -> Result<()> {
        safety_state_set(
            &self.pool,
            STATE_KEY_KILL,
            &json!({ "enabled": false }),
            &clock::now_iso(now),
        )
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
