//! Parley chat server daemon.

use anyhow::Context;
use clap::Parser;
use parley_server::{ChatServer, ServerConfig, ServerContext};
use parley_store::Store;
use std::path::PathBuf;
use tokio::sync::watch;

/// Multi-user chat server with offline delivery and file transfer.
#[derive(Parser)]
#[command(name = "parleyd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.as_str())
        .init();

    let config = match &cli.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    config.validate().context("invalid configuration")?;

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::create_dir_all(&config.storage_root)
        .with_context(|| format!("creating {}", config.storage_root.display()))?;

    let store = Store::open(&config.database_path)
        .await
        .context("opening store")?;
    let ctx = ServerContext::new(config, store);
    let server = ChatServer::bind(ctx).await.context("binding listener")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received");
            let _ = shutdown_tx.send(true);
        }
    });

    server.run(shutdown_rx).await.context("server run")?;
    Ok(())
}
