//! Passage Server - tunnel relay server.
//!
//! Runs next to the upstream inbound service, pairs with the client over the
//! control channel and relays the chosen data transport into the upstream.

mod config;
mod control;
mod registry;
mod tls;
mod transport;

use anyhow::Result;
use clap::Parser;
use config::{Args, ServerConfig};
use registry::ListenerRegistry;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

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

    let config = match ServerConfig::load(&args.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    info!("Starting passage-server v{}", env!("CARGO_PKG_VERSION"));
    info!("Control port: {}", config.control_port);
    info!("Upstream inbound: {}", config.xray_inbound_address);

    let registry = Arc::new(ListenerRegistry::new());

    let control = tokio::spawn(control::run(config, registry.clone()));
    registry.register("control", control.abort_handle());

    tokio::select! {
        _ = registry::wait_for_shutdown_signal() => {
            info!("Shutdown signal received, closing all listeners");
            registry.shutdown_all();
            info!("All listeners closed, exiting");
        }
        result = control => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Control channel failed: {:#}", e);
                    std::process::exit(1);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    error!("Control task panicked: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
