//! Client configuration.

use anyhow::{Context, Result};
use clap::Parser;
use passage_core::KcpTuning;
use serde::Deserialize;

/// Passage Client - forwards local traffic across the chosen transport.
#[derive(Parser, Debug)]
#[command(name = "passage-client")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the JSON configuration file
    #[arg(
        short,
        long,
        env = "PASSAGE_CLIENT_CONFIG",
        default_value = "client_config.json"
    )]
    pub config: String,

    /// Enable debug logging
    #[arg(long, env = "PASSAGE_DEBUG")]
    pub debug: bool,
}

/// Configuration loaded once from `client_config.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientConfig {
    /// Address of the server's control channel.
    pub control_server_address: String,
    /// Local `host:port` the forwarders bind, verbatim.
    pub local_listen_port: String,
    /// Host of the remote data listeners; ports arrive over the control
    /// channel.
    #[serde(rename = "RemoteServerIP")]
    pub remote_server_ip: String,
    #[serde(default)]
    pub kcp_config: KcpTuning,
}

impl ClientConfig {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read(path).with_context(|| format!("read config file {}", path))?;
        serde_json::from_slice(&raw).with_context(|| format!("parse config file {}", path))
    }

    /// Remote data address for a port announced over the control channel.
    pub fn remote_addr(&self, port: &str) -> String {
        format!("{}:{}", self.remote_server_ip, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "ControlServerAddress": "203.0.113.5:7000",
        "LocalListenPort": "127.0.0.1:1080",
        "RemoteServerIP": "203.0.113.5",
        "KcpConfig": {
            "NoDelay": 1,
            "Interval": 10,
            "Resend": 2,
            "NoCongestion": 1,
            "SndWnd": 1024,
            "RcvWnd": 1024,
            "DataShards": 10,
            "ParityShards": 3
        }
    }"#;

    #[test]
    fn test_parse_sample_config() {
        let config: ClientConfig = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(config.control_server_address, "203.0.113.5:7000");
        assert_eq!(config.local_listen_port, "127.0.0.1:1080");
        assert_eq!(config.remote_addr("7003"), "203.0.113.5:7003");
        assert_eq!(config.kcp_config.snd_wnd, 1024);
    }

    #[test]
    fn test_malformed_config_is_error() {
        assert!(serde_json::from_str::<ClientConfig>(r#"{"LocalListenPort":"x"}"#).is_err());
    }
}
