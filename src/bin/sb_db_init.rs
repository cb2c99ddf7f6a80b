use anyhow::{Context, Result};
use clap::Parser;
use shavar_client::SqliteStore;
use std::path::PathBuf;

#[derive(Parser)]
struct Cli {
    /// Path to the SQLite database to create (or migrate, if it already exists).
    #[arg(long, env = "SHAVAR_DB_PATH", default_value = "shavar.db")]
    db_path: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    println!("Initializing chunk cache at {}", cli.db_path.display());
    let _store = SqliteStore::open(&cli.db_path).context("failed to initialize chunk cache database")?;
    println!("Schema is up to date.");
    Ok(())
}
