use eyre::eyre;
use tokio::select;
use tokio::signal::unix;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use punch_helper::HelperServer;

use crate::{cli::Cli, config::DaemonConfig};

pub async fn run(cli: Cli) -> eyre::Result<()> {
    let mut config = match cli.config {
        Some(path) => DaemonConfig::from_path(path)?,
        None => {
            let listen_port = cli
                .listen_port
                .ok_or_else(|| eyre!("--listen_port is required when no config file is given"))?;
            DaemonConfig::from_listen_port(listen_port)
        }
    };
    if let Some(listen_port) = cli.listen_port {
        config.helper.listen_port = listen_port;
    }

    let env_filter = EnvFilter::builder()
        .with_default_directive(config.logger.level.into())
        .from_env()?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let server = HelperServer::new(config.helper);
    let cancellation = CancellationToken::new();

    let mut server_task = tokio::spawn({
        let cancellation = cancellation.clone();
        async move { server.run(cancellation).await }
    });

    let mut sigterm = unix::signal(SignalKind::terminate())?;
    let mut sigint = unix::signal(SignalKind::interrupt())?;

    select! {
        // Bind failures and listener errors land here.
        result = &mut server_task => {
            return Ok(result.expect("server task panicked")?);
        }
        _ = sigterm.recv() => info!("received SIGTERM signal"),
        _ = sigint.recv() => info!("received SIGINT signal"),
    }

    cancellation.cancel();
    server_task.await.expect("server task panicked")?;

    Ok(())
}
