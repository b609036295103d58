mod actions;

use std::path::PathBuf;

use clap::Parser;

/// Publicly reachable coordinator for TCP NAT traversal. Pairs peers and
/// drives the traversal protocol; never relays application data.
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Port to listen for peer connections on.
    #[arg(long = "listen_port")]
    pub listen_port: Option<u16>,

    /// Optional TOML configuration file; flags override it.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

pub async fn run() -> eyre::Result<()> {
    actions::run(Cli::parse()).await
}
