//! KCP tuning block.
//!
//! The eight-integer block shared by both config files. It is applied to
//! every KCP connection at creation and never mutated afterward.

use serde::{Deserialize, Serialize};
use tokio_kcp::{KcpConfig, KcpNoDelayConfig};

/// KCP tuning parameters, named as they appear in the config files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct KcpTuning {
    pub no_delay: i32,
    pub interval: i32,
    pub resend: i32,
    pub no_congestion: i32,
    pub snd_wnd: i32,
    pub rcv_wnd: i32,
    /// Reed-Solomon shard counts are part of the shared config blob; the KCP
    /// implementation used here carries no FEC layer, so they configure
    /// nothing.
    pub data_shards: i32,
    pub parity_shards: i32,
}

impl Default for KcpTuning {
    fn default() -> Self {
        Self {
            no_delay: 1,
            interval: 10,
            resend: 2,
            no_congestion: 1,
            snd_wnd: 1024,
            rcv_wnd: 1024,
            data_shards: 10,
            parity_shards: 3,
        }
    }
}

impl KcpTuning {
    /// Build the connection config applied to every KCP socket.
    pub fn to_kcp_config(&self) -> KcpConfig {
        let mut config = KcpConfig::default();
        config.nodelay = KcpNoDelayConfig {
            nodelay: self.no_delay != 0,
            interval: self.interval,
            resend: self.resend,
            nc: self.no_congestion != 0,
        };
        config.wnd_size = (clamp_window(self.snd_wnd), clamp_window(self.rcv_wnd));
        // the carrier is consumed as a byte stream, not discrete messages
        config.stream = true;
        config
    }
}

fn clamp_window(value: i32) -> u16 {
    value.clamp(1, u16::MAX as i32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_field_names() {
        let json = r#"{
            "NoDelay": 1,
            "Interval": 20,
            "Resend": 3,
            "NoCongestion": 0,
            "SndWnd": 512,
            "RcvWnd": 256,
            "DataShards": 10,
            "ParityShards": 3
        }"#;
        let tuning: KcpTuning = serde_json::from_str(json).unwrap();
        assert_eq!(tuning.interval, 20);
        assert_eq!(tuning.no_congestion, 0);

        let config = tuning.to_kcp_config();
        assert!(config.nodelay.nodelay);
        assert!(!config.nodelay.nc);
        assert_eq!(config.nodelay.interval, 20);
        assert_eq!(config.nodelay.resend, 3);
        assert_eq!(config.wnd_size, (512, 256));
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let tuning: KcpTuning = serde_json::from_str("{}").unwrap();
        assert_eq!(tuning, KcpTuning::default());
    }

    #[test]
    fn test_window_clamping() {
        let tuning = KcpTuning {
            snd_wnd: 0,
            rcv_wnd: 1 << 20,
            ..KcpTuning::default()
        };
        let config = tuning.to_kcp_config();
        assert_eq!(config.wnd_size, (1, u16::MAX));
    }
}
