//! Tunnel server binary.
//!
//! Loads a `ServerConfig` from a TOML file, builds the node, and runs
//! it until interrupted.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunnel_server::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "tunnel-server")]
#[command(about = "Run a tunnel exit node", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Path to the node's TOML config file
    #[arg(long, default_value = "tunnel-server.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let config = ServerConfig::load(&cli.config)?;
    info!(node_id = %config.node_id, config = %cli.config.display(), "loaded config");

    tunnel_server::run(config).await
}
