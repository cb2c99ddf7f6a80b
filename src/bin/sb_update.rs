use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use shavar_client::{Engine, EngineConfig, SqliteStore, UpdateOutcome};
use std::path::PathBuf;

#[derive(Parser)]
struct Cli {
    #[command(flatten)]
    engine: EngineConfig,

    /// Path to the SQLite database backing the chunk cache.
    #[arg(long, env = "SHAVAR_DB_PATH", default_value = "shavar.db")]
    db_path: PathBuf,

    /// Optional JSON status file, written once the cycle completes.
    #[arg(long)]
    progress_path: Option<PathBuf>,
}

#[derive(Serialize)]
struct ProgressData {
    status: String,
    outcome: String,
    timestamp: String,
}

fn write_progress(path: &PathBuf, progress: &ProgressData) -> Result<()> {
    let json = serde_json::to_string_pretty(progress)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    println!("Opening chunk cache at {}", cli.db_path.display());
    let storage = SqliteStore::open(&cli.db_path).context("failed to open chunk cache database")?;
    let engine = Engine::new(storage, cli.engine);

    println!("Running update cycle...");
    let outcome = engine.update().await;
    println!("Update cycle finished: {outcome}");

    if let Some(progress_path) = &cli.progress_path {
        let status = match outcome {
            UpdateOutcome::Successful | UpdateOutcome::NoData | UpdateOutcome::NoUpdate => "ok",
            _ => "error",
        };
        write_progress(
            progress_path,
            &ProgressData { status: status.to_string(), outcome: outcome.to_string(), timestamp: Utc::now().to_rfc3339() },
        )?;
    }

    engine.close().await.context("failed to close chunk cache cleanly")?;

    match outcome {
        UpdateOutcome::ServerError(_) | UpdateOutcome::InternalError(_) | UpdateOutcome::MacError | UpdateOutcome::MacKeyError => {
            std::process::exit(1);
        }
        _ => Ok(()),
    }
}
