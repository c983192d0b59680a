//! PeerLink CLI: runs a platform in the foreground or prints its config.

mod cli;
mod cmd;

use crate::cli::{Cli, Commands};
use clap::Parser;

/// `RUST_LOG` wins; otherwise the configured `log_level`.
fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    // Loaded again by the command once logging is up.
    let log_level = peerlink_kernel::load_config(cli.config.as_deref()).log_level;
    init_tracing_stderr(&log_level);

    let result = match cli.command {
        Commands::Start(args) => cmd::start(cli.config.as_deref(), args),
        Commands::Config => cmd::print_config(cli.config.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
