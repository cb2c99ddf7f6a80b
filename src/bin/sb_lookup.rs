use anyhow::{Context, Result};
use clap::Parser;
use shavar_client::{Engine, EngineConfig, SqliteStore};
use std::path::PathBuf;

#[derive(Parser)]
struct Cli {
    #[command(flatten)]
    engine: EngineConfig,

    #[arg(long, env = "SHAVAR_DB_PATH", default_value = "shavar.db")]
    db_path: PathBuf,

    /// URL to check against the locally cached lists.
    url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let storage = SqliteStore::open(&cli.db_path).context("failed to open chunk cache database")?;
    let engine = Engine::new(storage, cli.engine);

    match engine.lookup(&cli.url, &[]).await.context("lookup failed")? {
        Some(list) => {
            println!("{} MATCHED {}", cli.url, list);
            engine.close().await.ok();
            std::process::exit(2);
        }
        None => {
            println!("{} clean", cli.url);
        }
    }

    engine.close().await.context("failed to close chunk cache cleanly")?;
    Ok(())
}
