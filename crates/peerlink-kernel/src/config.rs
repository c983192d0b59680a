//! Configuration loading from `~/.peerlink/config.toml` with defaults.
//!
//! A missing or unreadable file is not an error: the platform starts with
//! defaults and logs why. Two environment variables override the file:
//! `PEERLINK_PORT` and `PEERLINK_CODEC`.

use crate::error::{KernelError, KernelResult};
use peerlink_types::config::{CodecKind, KernelConfig};
use peerlink_types::error::PeerLinkError;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Overrides the listening port.
pub const ENV_PORT: &str = "PEERLINK_PORT";
/// Overrides the wire codec.
pub const ENV_CODEC: &str = "PEERLINK_CODEC";

/// Load kernel configuration from a TOML file, with defaults.
pub fn load_config(path: Option<&Path>) -> KernelConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return KernelConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<KernelConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                KernelConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            KernelConfig::default()
        }
    }
}

/// Apply overrides looked up through `lookup` (normally the process
/// environment).
pub fn apply_overrides(
    config: &mut KernelConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> KernelResult<()> {
    if let Some(port) = lookup(ENV_PORT) {
        config.network.listen_port = port.trim().parse().map_err(|_| {
            KernelError::PeerLink(PeerLinkError::Config(format!(
                "{ENV_PORT} is not a valid port: {port}"
            )))
        })?;
    }
    if let Some(codec) = lookup(ENV_CODEC) {
        config.network.codec = codec.trim().parse::<CodecKind>()?;
    }
    Ok(())
}

/// Load the file, apply environment overrides and validate the result.
pub fn load_effective_config(path: Option<&Path>) -> KernelResult<KernelConfig> {
    let mut config = load_config(path);
    apply_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.network.validate()?;
    Ok(config)
}

/// Render a configuration as TOML.
pub fn render_config(config: &KernelConfig) -> KernelResult<String> {
    toml::to_string_pretty(config)
        .map_err(|e| KernelError::PeerLink(PeerLinkError::Serialization(e.to_string())))
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    peerlink_home().join("config.toml")
}

/// Get the PeerLink home directory.
pub fn peerlink_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".peerlink")
}
