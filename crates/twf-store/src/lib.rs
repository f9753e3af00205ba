//! twf-store
//!
//! SQLite-backed Event Store and State Store for the paper trading core.
//!
//! One database file holds both: the append-only `events` log (market data
//! + recorder lifecycle) and the transactional state tables (`orders`,
//! `fills`, `trades`, `positions`, `safety_state`, `health_checks`).
//!
//! Write helpers are generic over `sqlx::Executor` so a single intent can
//! commit its order/fill/trade/position mutations atomically in one
//! transaction; pass `&pool` for standalone writes or `&mut *tx` inside a
//! transaction.

use std::fmt;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

pub mod clock;
pub mod events;
pub mod state;

pub use clock::{now_iso, parse_ts_flexible, taipei_day};
pub use events::{append_event, latest_event_by_kind, list_events_by_kinds, EventRow, NewEvent};
pub use state::{
    close_latest_open_trade, fetch_open_trade, fetch_order, fetch_position, insert_fill,
    insert_health_check, insert_order, insert_trade, last_loss_close_ts, list_fills_for_order,
    list_recent_orders, recent_closed_trade_pnls, reject_counts_for_day, safety_state_get,
    safety_state_set, sum_realized_pnl_for_day, update_order_decision, update_order_status_meta,
    upsert_position, FillRow, NewFill, NewHealthCheck, NewOrder, NewTrade, OrderRow, PositionRow,
    TradeRow,
};

pub const ENV_DB_PATH: &str = "TWF_DB_PATH";

/// Default scan window for newest-first event scans.
pub const DEFAULT_SCAN_LIMIT: i64 = 2000;

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Store faults are non-recoverable per intent: callers abort the intent
/// and surface the code upward. They are never folded into gate verdicts.
#[derive(Debug)]
pub enum StoreError {
    /// A read or single write failed (`STORE_UNAVAILABLE`).
    Unavailable {
        context: String,
        source: sqlx::Error,
    },
    /// A multi-statement transaction could not commit (`STORE_TX_FAILED`).
    /// No partial state is exposed: the transaction rolled back.
    TxFailed {
        context: String,
        source: sqlx::Error,
    },
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Unavailable { .. } => "STORE_UNAVAILABLE",
            StoreError::TxFailed { .. } => "STORE_TX_FAILED",
        }
    }

    /// `map_err` adapter for single reads/writes.
    pub fn unavailable(context: impl Into<String>) -> impl FnOnce(sqlx::Error) -> Self {
        let context = context.into();
        move |source| StoreError::Unavailable { context, source }
    }

    /// `map_err` adapter for transaction begin/commit.
    pub fn tx_failed(context: impl Into<String>) -> impl FnOnce(sqlx::Error) -> Self {
        let context = context.into();
        move |source| StoreError::TxFailed { context, source }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable { context, source } => {
                write!(f, "STORE_UNAVAILABLE: {context}: {source}")
            }
            StoreError::TxFailed { context, source } => {
                write!(f, "STORE_TX_FAILED: {context}: {source}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Unavailable { source, .. } | StoreError::TxFailed { source, .. } => {
                Some(source)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pool bootstrap
// ---------------------------------------------------------------------------

/// Open (and create if missing) the database at `path`.
pub async fn connect(path: &str) -> anyhow::Result<SqlitePool> {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await
        .with_context(|| format!("failed to open sqlite db at {path}"))?;

    Ok(pool)
}

/// Connect using the `TWF_DB_PATH` env knob.
pub async fn connect_from_env() -> anyhow::Result<SqlitePool> {
    let path =
        std::env::var(ENV_DB_PATH).with_context(|| format!("missing env var {ENV_DB_PATH}"))?;
    connect(&path).await
}

/// In-memory database for tests.
///
/// Capped at one connection: each SQLite `:memory:` connection is its own
/// database, so a wider pool would hand tests fresh empty schemas.
pub async fn connect_memory() -> anyhow::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("failed to open in-memory sqlite db")?;
    Ok(pool)
}

/// Run embedded migrations.
pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Test helper: fresh migrated in-memory store.
pub async fn testkit_memory_pool() -> anyhow::Result<SqlitePool> {
    let pool = connect_memory().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Test helper: migrated store at a caller-supplied file path (used by
/// restart-durability scenarios that reopen the same file).
pub async fn testkit_file_pool(path: &str) -> anyhow::Result<SqlitePool> {
    let pool = connect(path).await?;
    migrate(&pool).await?;
    Ok(pool)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_orders_table: bool,
}

/// Connectivity + schema presence probe.
pub async fn status(pool: &SqlitePool) -> Result<DbStatus, StoreError> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .map_err(StoreError::unavailable("status connectivity query"))?;

    let (exists,): (i64,) = sqlx::query_as(
        "select count(1) from sqlite_master where type = 'table' and name = 'orders'",
    )
    .fetch_one(pool)
    .await
    .map_err(StoreError::unavailable("status table-exists query"))?;

    Ok(DbStatus {
        ok: one == 1,
        has_orders_table: exists > 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_and_status() {
        let pool = testkit_memory_pool().await.unwrap();
        let st = status(&pool).await.unwrap();
        assert!(st.ok);
        assert!(st.has_orders_table);
    }

    #[tokio::test]
    async fn store_error_codes() {
        let e = StoreError::Unavailable {
            context: "x".into(),
            source: sqlx::Error::PoolClosed,
        };
        assert_eq!(e.code(), "STORE_UNAVAILABLE");
        assert!(e.to_string().contains("STORE_UNAVAILABLE"));
    }
}
