//! `wardend` entry point: parse the config path, load it, and run the
//! daemon until a fatal socket-setup error or a signal ends the
//! process.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use wardend::{Configuration, Server};

#[derive(Parser)]
#[command(name = "wardend")]
#[command(about = "Container management daemon")]
#[command(version)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("wardend={}", log_level).into()),
        )
        .init();

    info!("starting wardend v{}", env!("CARGO_PKG_VERSION"));

    info!(path = %cli.config, "loading configuration");
    let config = Configuration::load(&cli.config)?;

    let server = Server::new(config)?;
    if let Err(e) = server.run().await {
        error!("fatal server error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
