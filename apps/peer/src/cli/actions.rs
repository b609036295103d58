use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::EnvFilter;

use punch_peer::PeerConfig;
use punch_proto::{BuddyId, Endpoint};

use crate::cli::{resolve::resolve, Cli};

/// Largest buddy reply we read and print.
const REPLY_BUF: usize = 64;

pub async fn run(cli: Cli) -> eyre::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env()?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let helper_ip = resolve(&cli.helper_ip).await?;
    let local_ip = resolve(&cli.local_ip).await?;
    let buddy_ext_ip = resolve(&cli.buddy_ext_ip).await?;
    let buddy_int_ip = resolve(&cli.buddy_int_ip).await?;

    let config = PeerConfig {
        helper: Endpoint::new(helper_ip, cli.helper_port),
        local: Endpoint::new(local_ip, cli.local_port),
        buddy: BuddyId {
            ext_ip: buddy_ext_ip,
            int_ip: buddy_int_ip,
            int_port: cli.buddy_int_port,
        },
        device: cli.device,
        pretend_random: cli.random,
    };

    let stream = punch_peer::connect(config).await?;
    stream.set_nonblocking(true)?;
    let mut stream = tokio::net::TcpStream::from_std(stream)?;

    stream.write_all(cli.message.as_bytes()).await?;
    info!("sent message to buddy");

    let mut buf = [0u8; REPLY_BUF];
    let n = stream.read(&mut buf[..REPLY_BUF - 1]).await?;
    if n > 0 {
        println!("buddy replied: {}", String::from_utf8_lossy(&buf[..n]));
    } else {
        println!("buddy closed the connection without replying");
    }

    Ok(())
}
