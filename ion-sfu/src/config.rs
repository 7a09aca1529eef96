//! SFU Configuration

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest retention buffer the receiver accepts (half the RTP sequence space)
pub const MAX_RECEIVER_BUFFER_SIZE: usize = 32768;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sfu: SfuConfig,
    pub webrtc: WebRtcConfig,
    pub logging: LoggingConfig,
    pub elements: ElementsConfig,
}

/// Forwarding-path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Number of packets each receiver retains for retransmission.
    /// Rounded up to a power of two.
    pub receiver_buffer_size: usize,
    /// Upper bound on a single sender write before the packet is dropped
    /// for that subscriber
    pub sender_write_timeout_ms: u64,
    /// Capacity of the per-router RTCP feedback queue
    pub rtcp_channel_capacity: usize,
    /// Interval of unsolicited keyframe requests to video publishers (0 = off)
    pub keyframe_interval_ms: u64,
    /// Interval of the empty-session sweep
    pub session_cleanup_interval_secs: u64,
    /// Maximum transports per session (0 = unlimited)
    pub max_transports_per_session: usize,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            receiver_buffer_size: 512,
            sender_write_timeout_ms: 20,
            rtcp_channel_capacity: 64,
            keyframe_interval_ms: 3000,
            session_cleanup_interval_secs: 60,
            max_transports_per_session: 0,
        }
    }
}

impl SfuConfig {
    /// Effective retention depth: a power of two in `1..=32768`
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.receiver_buffer_size
            .clamp(1, MAX_RECEIVER_BUFFER_SIZE)
            .next_power_of_two()
    }

    #[must_use]
    pub const fn sender_write_timeout(&self) -> Duration {
        Duration::from_millis(self.sender_write_timeout_ms)
    }

    #[must_use]
    pub const fn keyframe_interval(&self) -> Option<Duration> {
        if self.keyframe_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.keyframe_interval_ms))
        }
    }
}

/// TURN server credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Negotiation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN servers
    pub turn_servers: Vec<TurnServer>,
    /// Lower bound of the UDP port range used for ICE (0 = ephemeral)
    pub udp_port_min: u16,
    /// Upper bound of the UDP port range used for ICE (0 = ephemeral)
    pub udp_port_max: u16,
    /// Public IPs to advertise in host candidates (NAT 1:1)
    pub nat_1to1_ips: Vec<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            udp_port_min: 0,
            udp_port_max: 0,
            nat_1to1_ips: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Configuration for processing elements
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementsConfig {
    /// Directory that file-backed elements write into
    pub output_dir: PathBuf,
}

impl Default for ElementsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // ION_SFU__RECEIVER_BUFFER_SIZE, ION_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("ION")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sfu.buffer_capacity(), 512);
        assert_eq!(config.sfu.sender_write_timeout(), Duration::from_millis(20));
        assert_eq!(config.logging.level, "info");
        assert!(!config.webrtc.stun_servers.is_empty());
    }

    #[test]
    fn test_buffer_capacity_rounding() {
        let mut sfu = SfuConfig {
            receiver_buffer_size: 500,
            ..Default::default()
        };
        assert_eq!(sfu.buffer_capacity(), 512);

        sfu.receiver_buffer_size = 0;
        assert_eq!(sfu.buffer_capacity(), 1);

        sfu.receiver_buffer_size = 1_000_000;
        assert_eq!(sfu.buffer_capacity(), MAX_RECEIVER_BUFFER_SIZE);
    }

    #[test]
    fn test_keyframe_interval_disabled() {
        let sfu = SfuConfig {
            keyframe_interval_ms: 0,
            ..Default::default()
        };
        assert!(sfu.keyframe_interval().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[sfu]\nreceiver_buffer_size = 1024\n\n[elements]\noutput_dir = \"/tmp/recordings\""
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.sfu.buffer_capacity(), 1024);
        assert_eq!(config.elements.output_dir, PathBuf::from("/tmp/recordings"));
        // untouched sections keep their defaults
        assert_eq!(config.sfu.sender_write_timeout_ms, 20);
    }
}
