use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

mod cli;
mod commands;
mod handlers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info,cadence_scheduler=info".into()),
        )
        .init();

    let cli = cli::Cli::parse();

    // load config: --config / CADENCE_CONFIG > ~/.cadence/cadence.toml
    let config =
        cadence_core::CadenceConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
            warn!(code = e.code(), "Config load failed ({}), using defaults", e);
            cadence_core::CadenceConfig::default()
        });

    let db_path = cli
        .database
        .clone()
        .unwrap_or_else(|| config.database.path.clone());
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");
    let ledger = Arc::new(cadence_scheduler::JobLedger::open(&db_path)?);

    commands::dispatch(cli.command, &config, ledger).await
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
