//! `dds-server` — the ECS DDS broker process.
//!
//! Runs the in-memory broker until SIGINT, then closes every client
//! connection and exits.

use anyhow::Result;
use clap::{Parser, Subcommand};

use ipi_ecs_dds::{Broker, BrokerConfig};

#[derive(Parser)]
#[command(name = "dds-server", about = "Experiment Control System DDS broker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker (default).
    Serve {
        /// Bind address.
        #[arg(long)]
        host: Option<String>,
        /// Bind port; defaults to IPI_ECS_DDS_PORT or the wire constant.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let (host, port) = match cli.command {
        Some(Command::Serve { host, port }) => (host, port),
        None => (None, None),
    };

    let mut config = BrokerConfig::from_env();
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    let broker = Broker::bind(&config).await?;
    log::info!("dds-server listening on {}", broker.local_addr());

    tokio::signal::ctrl_c().await?;
    log::info!("SIGINT received, shutting down");
    broker.shutdown();
    Ok(())
}
