//! Clap CLI definitions for PeerLink.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// PeerLink: peer-to-peer agent directory platform.
#[derive(Parser, Debug)]
#[command(name = "peerlink", version, about = "Run a PeerLink agent platform")]
pub struct Cli {
    /// Path to config file (default: ~/.peerlink/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a platform and run until Ctrl+C.
    Start(StartArgs),
    /// Print the effective configuration as TOML.
    Config,
}

#[derive(clap::Args, Debug, Default)]
pub struct StartArgs {
    /// Listening port (overrides config and PEERLINK_PORT).
    #[arg(long)]
    pub port: Option<u16>,

    /// Wire codec: binary, binary-compat, document or structured-text.
    #[arg(long)]
    pub codec: Option<String>,

    /// Peer to connect to on startup. Repeatable.
    #[arg(long = "peer")]
    pub peers: Vec<SocketAddr>,

    /// Agent to host on this platform. Repeatable.
    #[arg(long = "agent")]
    pub agents: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start() {
        let cli = Cli::try_parse_from([
            "peerlink",
            "start",
            "--port",
            "5000",
            "--codec",
            "document",
            "--peer",
            "127.0.0.1:4444",
            "--peer",
            "127.0.0.1:4445",
            "--agent",
            "echo",
            "--config",
            "/tmp/pl.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/pl.toml")));
        let Commands::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert_eq!(args.port, Some(5000));
        assert_eq!(args.codec.as_deref(), Some("document"));
        assert_eq!(args.peers.len(), 2);
        assert_eq!(args.agents, vec!["echo"]);
    }

    #[test]
    fn test_parse_rejects_bad_peer() {
        assert!(Cli::try_parse_from(["peerlink", "start", "--peer", "nowhere"]).is_err());
        assert!(Cli::try_parse_from(["peerlink"]).is_err());
    }

    #[test]
    fn test_parse_config() {
        let cli = Cli::try_parse_from(["peerlink", "config"]).unwrap();
        assert!(matches!(cli.command, Commands::Config));
        assert!(cli.config.is_none());
    }
}
