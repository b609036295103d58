mod actions;
mod resolve;

use clap::Parser;

/// Establish a direct TCP connection to a buddy behind another NAT, send one
/// message, print the reply.
///
/// Needs CAP_NET_RAW for raw packet capture and injection.
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Helper hostname or IP.
    #[arg(long = "helper_ip")]
    pub helper_ip: String,

    /// Helper port to connect to.
    #[arg(long = "helper_port")]
    pub helper_port: u16,

    /// Local internal hostname or IP.
    #[arg(long = "local_ip")]
    pub local_ip: String,

    /// Local internal port for the buddy connection.
    #[arg(long = "local_port")]
    pub local_port: u16,

    /// External hostname or IP of the buddy's NAT.
    #[arg(long = "buddy_ext_ip")]
    pub buddy_ext_ip: String,

    /// Internal hostname or IP of the buddy.
    #[arg(long = "buddy_int_ip")]
    pub buddy_int_ip: String,

    /// Internal port of the buddy.
    #[arg(long = "buddy_int_port")]
    pub buddy_int_port: u16,

    /// Message to send to the buddy once connected.
    #[arg(long = "message")]
    pub message: String,

    /// Network device to capture and inject on; autodetected when absent.
    #[arg(long = "device")]
    pub device: Option<String>,

    /// Pretend this peer's NAT allocates ports randomly (testing switch).
    #[arg(long = "random")]
    pub random: bool,
}

pub async fn run() -> eyre::Result<()> {
    actions::run(Cli::parse()).await
}
