//! Configuration types.
//!
//! All network settings take effect only before the first connection attempt
//! (and, for heartbeat settings, at the next detector start).

use crate::error::PeerLinkError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default listening port.
pub const DEFAULT_LISTEN_PORT: u16 = 4444;
/// Default heartbeat interval (seconds).
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;
/// Default heartbeat timeout multiplier.
pub const DEFAULT_HEARTBEAT_MULTIPLIER: u32 = 3;
/// Default number of consecutive bind failures before giving up.
pub const DEFAULT_BIND_RETRY_THRESHOLD: u32 = 60;

/// Wire codec selection. Peers that talk to each other must agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CodecKind {
    /// MessagePack map encoding.
    #[default]
    Binary,
    /// MessagePack positional encoding (older wire format).
    BinaryCompat,
    /// YAML document tree, length-prefixed.
    Document,
    /// JSON, length-prefixed.
    StructuredText,
}

impl CodecKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::BinaryCompat => "binary-compat",
            Self::Document => "document",
            Self::StructuredText => "structured-text",
        }
    }

    /// Textual codecs need an explicit length header on the stream.
    pub fn is_textual(&self) -> bool {
        matches!(self, Self::Document | Self::StructuredText)
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecKind {
    type Err = PeerLinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" => Ok(Self::Binary),
            "binary-compat" | "binary_compat" => Ok(Self::BinaryCompat),
            "document" => Ok(Self::Document),
            "structured-text" | "structured_text" => Ok(Self::StructuredText),
            other => Err(PeerLinkError::UnsupportedCodec(other.to_string())),
        }
    }
}

/// Network transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface to bind the listener on.
    pub listen_host: String,
    /// Port to bind the listener on.
    pub listen_port: u16,
    /// Host announced to peers. Defaults to the address peers observe.
    pub advertised_host: Option<String>,
    /// On port conflict, try the next higher port instead of waiting.
    pub dynamic_port: bool,
    /// Wire codec.
    pub codec: CodecKind,
    /// Run the heartbeat failure detector.
    pub heartbeat_enabled: bool,
    /// Heartbeat probe interval (seconds).
    pub heartbeat_interval_secs: u64,
    /// A peer is evicted after this many silent intervals.
    pub heartbeat_timeout_multiplier: u32,
    /// Consecutive bind failures before the network start is aborted.
    pub bind_retry_threshold: u32,
    /// Wait between bind attempts when dynamic port selection is off (ms).
    pub bind_retry_backoff_ms: u64,
    /// Outbound connect attempts before a message is backlogged.
    pub connect_attempts: u32,
    /// Spacing and per-attempt bound of outbound connects (ms).
    pub connect_retry_interval_ms: u64,
    /// Outbound queue poll timeout (ms).
    pub queue_poll_ms: u64,
    /// Bound on shutdown waits (ms).
    pub drain_timeout_ms: u64,
    /// How long traffic from a peer that announced shutdown is ignored (seconds).
    pub disconnect_cooldown_secs: u64,
    /// Human-readable node name sent with resync requests.
    pub node_name: String,
    /// Platform id; a random one is generated when absent.
    pub platform_id: Option<String>,
    /// Peers to connect to at startup (`host:port`).
    pub bootstrap_peers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            advertised_host: None,
            dynamic_port: false,
            codec: CodecKind::default(),
            heartbeat_enabled: true,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            heartbeat_timeout_multiplier: DEFAULT_HEARTBEAT_MULTIPLIER,
            bind_retry_threshold: DEFAULT_BIND_RETRY_THRESHOLD,
            bind_retry_backoff_ms: 3_000,
            connect_attempts: 3,
            connect_retry_interval_ms: 1_000,
            queue_poll_ms: 2_000,
            drain_timeout_ms: 5_000,
            disconnect_cooldown_secs: 15,
            node_name: "peerlink-node".to_string(),
            platform_id: None,
            bootstrap_peers: Vec::new(),
        }
    }
}

impl NetworkConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn bind_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.bind_retry_backoff_ms)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }

    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn disconnect_cooldown(&self) -> Duration {
        Duration::from_secs(self.disconnect_cooldown_secs)
    }

    /// Reject settings that would make loops spin or never retry.
    pub fn validate(&self) -> Result<(), PeerLinkError> {
        if self.bind_retry_threshold == 0 {
            return Err(PeerLinkError::Config(
                "bind_retry_threshold must be at least 1".into(),
            ));
        }
        if self.connect_attempts == 0 {
            return Err(PeerLinkError::Config(
                "connect_attempts must be at least 1".into(),
            ));
        }
        if self.heartbeat_enabled
            && (self.heartbeat_interval_secs == 0 || self.heartbeat_timeout_multiplier == 0)
        {
            return Err(PeerLinkError::Config(
                "heartbeat interval and timeout multiplier must be non-zero".into(),
            ));
        }
        if self.queue_poll_ms == 0 {
            return Err(PeerLinkError::Config("queue_poll_ms must be non-zero".into()));
        }
        Ok(())
    }
}

/// Top-level platform configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Default tracing filter when `RUST_LOG` is not set.
    pub log_level: String,
    /// Network transport settings.
    pub network: NetworkConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            network: NetworkConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_defaults() {
        let cfg = NetworkConfig::default();
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(cfg.bind_retry_threshold, 60);
        assert_eq!(cfg.disconnect_cooldown(), Duration::from_secs(15));
        assert_eq!(cfg.queue_poll(), Duration::from_secs(2));
        assert_eq!(cfg.bind_retry_backoff(), Duration::from_secs(3));
        assert_eq!(cfg.connect_attempts, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_codec_parse() {
        assert_eq!("binary".parse::<CodecKind>().unwrap(), CodecKind::Binary);
        assert_eq!(
            "Structured-Text".parse::<CodecKind>().unwrap(),
            CodecKind::StructuredText
        );
        assert_eq!(
            "binary_compat".parse::<CodecKind>().unwrap(),
            CodecKind::BinaryCompat
        );
        let err = "xml-rpc".parse::<CodecKind>().unwrap_err();
        assert!(matches!(err, PeerLinkError::UnsupportedCodec(ref s) if s == "xml-rpc"));
        assert!(CodecKind::Document.is_textual());
        assert!(!CodecKind::BinaryCompat.is_textual());
    }

    #[test]
    fn test_partial_toml() {
        let cfg: KernelConfig = toml::from_str(
            r#"
            log_level = "debug"
            [network]
            listen_port = 9000
            codec = "structured-text"
        "#,
        )
        .unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.network.listen_port, 9000);
        assert_eq!(cfg.network.codec, CodecKind::StructuredText);
        assert_eq!(cfg.network.heartbeat_interval_secs, 5);
    }

    #[test]
    fn test_unknown_codec_rejected_by_toml() {
        let res: Result<KernelConfig, _> = toml::from_str(
            r#"
            [network]
            codec = "xml"
        "#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let cfg = NetworkConfig {
            bind_retry_threshold: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(PeerLinkError::Config(_))));
    }
}
