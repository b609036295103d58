//! Listener and session spawn/teardown.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use punch_proto::Endpoint;
use punch_registry::Registry;

use crate::config::HelperConfig;
use crate::error::SessionError;
use crate::session::SessionWorker;

/// The helper daemon: one listener, one detached worker per accepted
/// connection, one shared registry.
pub struct HelperServer {
    config: HelperConfig,
    registry: Arc<Registry>,
    task_tracker: TaskTracker,
}

impl HelperServer {
    pub fn new(config: HelperConfig) -> Self {
        Self {
            config,
            registry: Registry::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// The shared session registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Bind the listen port and serve until cancelled.
    ///
    /// A bind or listen failure is fatal; accept failures are logged and the
    /// listener keeps going. On cancellation, in-flight sessions are awaited
    /// before returning.
    pub async fn run(&self, cancellation: CancellationToken) -> io::Result<()> {
        let listener =
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.listen_port)).await?;
        info!(port = self.config.listen_port, "listening for peers");

        loop {
            select! {
                _ = cancellation.cancelled() => {
                    info!("shutting down listener");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_session(stream, addr),
                    Err(err) => error!(%err, "accept failed"),
                }
            }
        }

        self.task_tracker.close();
        self.task_tracker.wait().await;

        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, addr: SocketAddr) {
        let SocketAddr::V4(addr) = addr else {
            warn!(%addr, "dropping non-IPv4 peer connection");
            return;
        };
        let observed = Endpoint::new(*addr.ip(), addr.port());
        info!(%observed, "accepted peer connection");

        let worker =
            SessionWorker::new(stream, observed, &self.registry, self.config.timeouts());

        self.task_tracker.spawn(async move {
            match worker.run().await {
                Ok(()) => info!(%observed, "session finished"),
                // Second connections close without a HELLO; that is the
                // port-prediction probe doing its job.
                Err(SessionError::NoHello(err)) => {
                    debug!(%observed, %err, "session closed without HELLO")
                }
                Err(err) => error!(%observed, %err, "session failed"),
            }
        });
    }
}
