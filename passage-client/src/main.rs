//! Passage Client - tunnel relay client.
//!
//! Runs next to the user's applications, keeps a control connection to the
//! server and forwards local traffic across whichever transport the server
//! announces.

mod config;
mod control;
mod forwarder;
mod tls;

use anyhow::Result;
use clap::Parser;
use config::{Args, ClientConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Delay between control-channel reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _ = FmtSubscriber::builder()
        .with_max_level(if args.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .try_init();

    let config = match ClientConfig::load(&args.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    info!("Starting passage-client v{}", env!("CARGO_PKG_VERSION"));
    info!("Control server: {}", config.control_server_address);
    info!("Local listen address: {}", config.local_listen_port);

    loop {
        info!(
            "Attempting to connect to control server at {}",
            config.control_server_address
        );
        match TcpStream::connect(&config.control_server_address).await {
            Ok(conn) => {
                info!("Connected to control server");
                match control::run(conn, config.clone()).await {
                    Ok(()) => info!("Control connection closed, will reconnect"),
                    Err(e) => warn!("Control connection lost: {}, will reconnect", e),
                }
            }
            Err(e) => warn!("Control connect failed: {}", e),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
