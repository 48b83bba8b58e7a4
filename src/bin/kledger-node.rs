#![forbid(unsafe_code)]
//! Ledger node: loads configuration, restores state and serves the API.

use clap::Parser;
use kledger::config::{load_config, DEFAULT_CONFIG_PATH};
use kledger::node::Node;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "KLEDGER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,
    /// Port to listen on, overriding the configuration
    #[arg(long)]
    port: Option<u16>,
    /// SQLite database path, overriding the configuration
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(database) = cli.database {
        config.database.path = database;
    }

    tracing::info!(
        config = %cli.config,
        database = %config.database.path,
        port = config.server.port,
        "Starting kledger node"
    );

    let node = Arc::new(Node::open(config)?);
    node.start().await?;
    Ok(())
}
