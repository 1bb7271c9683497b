//! Server configuration.

use anyhow::{Context, Result};
use clap::Parser;
use passage_core::{KcpTuning, Transport};
use serde::Deserialize;
use std::collections::HashMap;

/// Passage Server - relays chosen transports into the upstream inbound.
#[derive(Parser, Debug)]
#[command(name = "passage-server")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the JSON configuration file
    #[arg(
        short,
        long,
        env = "PASSAGE_SERVER_CONFIG",
        default_value = "server_config.json"
    )]
    pub config: String,

    /// Enable debug logging
    #[arg(long, env = "PASSAGE_DEBUG")]
    pub debug: bool,
}

/// Configuration loaded once from `server_config.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerConfig {
    /// Port the control channel listens on.
    pub control_port: String,
    /// Transport name (`TCP`, `WSMux`, ...) to data port.
    pub data_ports: HashMap<String, String>,
    /// Upstream inbound the data plane relays into.
    pub xray_inbound_address: String,
    #[serde(default)]
    pub tls_cert_path: String,
    #[serde(default)]
    pub tls_key_path: String,
    #[serde(default)]
    pub kcp_config: KcpTuning,
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read(path).with_context(|| format!("read config file {}", path))?;
        serde_json::from_slice(&raw).with_context(|| format!("parse config file {}", path))
    }

    /// The configured data port for a transport; empty when absent.
    pub fn data_port(&self, transport: Transport) -> String {
        self.data_ports
            .get(transport.data_port_key())
            .cloned()
            .unwrap_or_default()
    }

    /// The bind address for a transport's data listener.
    pub fn data_addr(&self, transport: Transport) -> String {
        format!("0.0.0.0:{}", self.data_port(transport))
    }
}
