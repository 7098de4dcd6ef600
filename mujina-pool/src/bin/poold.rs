//! Main entry point for the mujina-pool daemon.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use mujina_pool::config::{Config, DEFAULT_PATH};
use mujina_pool::{daemon::Daemon, tracing};

#[derive(Debug, Parser)]
#[command(version, about = "Stratum v1 mining pool server")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load_from(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    tracing::init_journald_or_stdout(config.log_level());

    let daemon = Daemon::new(config);
    daemon.run().await
}
