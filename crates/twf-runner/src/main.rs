//! `twf` — paper runner CLI.
//!
//! Exit codes: 0 success, 2 smoke gate-failure mismatch, 3 unexpected
//! error in the runner.

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod lock;

#[derive(Parser)]
#[command(name = "twf")]
#[command(about = "Taiwan index futures paper trading runner", long_about = None)]
struct Cli {
    /// SQLite database path (overrides TWF_DB_PATH).
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Rebuild 1-minute bars from the event log
    Bars,

    /// Run the read-only reconcile audit and record a health check
    Recon,

    /// Inject a synthetic book seed event (offline smoke fixture)
    SeedBook {
        /// Contract code (defaults to TWF_FOP_CODE or TMFB6)
        #[arg(long)]
        code: Option<String>,
        #[arg(long, default_value_t = 20000.0)]
        bid: f64,
        #[arg(long, default_value_t = 20001.0)]
        ask: f64,
    },

    /// Paper-live smoke flow: one expected reject, one accepted order
    /// matched to a fill. Exit 2 on any gate mismatch.
    Smoke,

    /// One signal-runner pass: rebuild bars, feed the trend strategy and
    /// place the resulting intent (if any) through the gate chain.
    Strategies {
        /// How many recent 1m bars to replay into the strategy.
        #[arg(long, default_value_t = 30)]
        lookback: i64,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[FATAL] {e:#}");
            ExitCode::from(3)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let db_path = cli
        .db
        .or_else(|| twf_config::env_str(twf_config::ENV_DB_PATH))
        .unwrap_or_else(|| "runtime/data/twf_autotrader_v1.sqlite3".to_string());

    match cli.cmd {
        Commands::Db { cmd } => commands::db(&db_path, cmd).await.map(|_| ExitCode::SUCCESS),
        Commands::Bars => commands::bars(&db_path).await.map(|_| ExitCode::SUCCESS),
        Commands::Recon => commands::recon(&db_path).await.map(|_| ExitCode::SUCCESS),
        Commands::SeedBook { code, bid, ask } => commands::seed_book(&db_path, code, bid, ask)
            .await
            .map(|_| ExitCode::SUCCESS),
        Commands::Smoke => commands::smoke(&db_path).await,
        Commands::Strategies { lookback } => commands::strategies(&db_path, lookback).await,
    }
}
