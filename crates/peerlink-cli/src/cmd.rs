//! Command implementations.

use crate::cli::StartArgs;
use peerlink_kernel::config::{load_effective_config, render_config};
use peerlink_kernel::{KernelError, KernelResult, Platform};
use peerlink_types::config::{CodecKind, KernelConfig};
use std::path::Path;
use tracing::{info, warn};

/// File, then environment, then command-line flags.
pub fn effective_config(path: Option<&Path>, args: &StartArgs) -> KernelResult<KernelConfig> {
    let mut config = load_effective_config(path)?;
    if let Some(port) = args.port {
        config.network.listen_port = port;
    }
    if let Some(codec) = &args.codec {
        config.network.codec = codec.parse::<CodecKind>()?;
    }
    for peer in &args.peers {
        let peer = peer.to_string();
        if !config.network.bootstrap_peers.contains(&peer) {
            config.network.bootstrap_peers.push(peer);
        }
    }
    config.network.validate()?;
    Ok(config)
}

pub fn print_config(path: Option<&Path>) -> KernelResult<()> {
    let config = load_effective_config(path)?;
    print!("{}", render_config(&config)?);
    Ok(())
}

pub fn start(path: Option<&Path>, args: StartArgs) -> KernelResult<()> {
    let config = effective_config(path, &args)?;
    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| KernelError::BootFailed(format!("tokio runtime: {e}")))?;
    rt.block_on(run(config, args.agents))
}

async fn run(config: KernelConfig, agents: Vec<String>) -> KernelResult<()> {
    let platform = Platform::boot(config).await?;

    for name in agents {
        let mut mailbox = platform.register_agent(&name)?;
        tokio::spawn(async move {
            while let Some(msg) = mailbox.recv().await {
                info!(agent = %name, message = %msg.summary(), "Message received");
            }
        });
    }

    info!(
        address = %platform.local_addr(),
        platform_id = %platform.node().platform_id(),
        "Platform running, press Ctrl+C to stop"
    );

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "Ctrl+C handler failed, shutting down");
            }
        }
        _ = platform.supervisor().wait() => {}
    }

    platform.shutdown().await;
    Ok(())
}
