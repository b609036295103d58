//! The TTL-staged direct connection attempt.
//!
//! The kernel must send a real SYN toward the buddy so the local NAT opens
//! state for the flow, but that SYN must never reach the buddy's NAT: with
//! no listener there it would be answered with an RST that tears the state
//! back down. The socket's IP TTL is dropped to [`TTL_TOO_LOW`] before
//! connect(), letting the SYN die at an intermediate hop, and restored to
//! [`TTL_OK`] right after connect() returns so the established flow routes
//! normally.
//!
//! The connect() itself usually fails with a timeout. That is fine: what
//! matters is the half-open socket the kernel keeps, which the buddy's
//! forged SYN/ACK will complete.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::Socket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use punch_proto::Endpoint;
use punch_registry::SetOnce;

use crate::error::PeerError;
use crate::sockets;

/// TTL low enough to die before the buddy's NAT, high enough to clear ours.
/// Hard-coded, like the rest of the staging; probing it is future work.
pub const TTL_TOO_LOW: u32 = 2;

/// Normal TTL restored after the staged connect.
pub const TTL_OK: u32 = 64;

/// Bound on waiting for the attempt to resolve either way.
pub const DIRECT_CONN_TIMEOUT: Duration = Duration::from_secs(180);

/// The buddy-facing socket and the worker that connects it.
pub struct DirectConn {
    socket: Option<Socket>,
    port: u16,
    status: Arc<SetOnce<bool>>,
    capture_stop: CancellationToken,
    worker: Option<JoinHandle<Option<std::net::TcpStream>>>,
}

impl DirectConn {
    /// Bind the buddy socket at the chosen local port.
    pub fn bind(port: u16) -> io::Result<Self> {
        Ok(Self {
            socket: Some(sockets::bind_tcp(port)?),
            port,
            status: Arc::new(SetOnce::new()),
            capture_stop: CancellationToken::new(),
            worker: None,
        })
    }

    /// The local port the buddy socket is currently bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Throw away the current socket and bind a new one.
    ///
    /// Used after a birthday attempt: the NAT revealed which internal port
    /// its surviving mapping belongs to, and the direct attempt must
    /// originate from exactly that port to reuse it.
    pub fn rebind(&mut self, port: u16) -> io::Result<()> {
        self.socket.take();
        self.socket = Some(sockets::bind_tcp(port)?);
        self.port = port;
        Ok(())
    }

    /// Completion flag of the attempt: `true` for connected, `false` for
    /// failed. Unset while the worker is still inside connect().
    pub fn status(&self) -> Arc<SetOnce<bool>> {
        self.status.clone()
    }

    /// Token fired when the attempt fails, so a SYN capture that will never
    /// match can stop looping.
    pub fn capture_stop(&self) -> CancellationToken {
        self.capture_stop.clone()
    }

    /// Kick off the staged connect toward the buddy on a blocking thread.
    pub fn start(&mut self, buddy: Endpoint) -> Result<(), PeerError> {
        let socket = self.socket.take().ok_or(PeerError::DirectConnFailed)?;
        let status = self.status.clone();
        let stop = self.capture_stop.clone();
        let addr = SocketAddr::from((buddy.ip, buddy.port));

        self.worker = Some(tokio::task::spawn_blocking(move || {
            // Give the SYN sniffer a moment to open its capture channel;
            // the SYN below must not beat it onto the wire.
            std::thread::sleep(Duration::from_secs(1));

            if socket.set_ttl(TTL_TOO_LOW).is_err() {
                status.set(false);
                stop.cancel();
                return None;
            }

            debug!(%buddy, "starting staged connect");
            let connected = socket.connect(&addr.into());
            // Restore routing for the (maybe) established flow no matter
            // how connect() went.
            let _ = socket.set_ttl(TTL_OK);

            match connected {
                Ok(()) => {
                    debug!(%buddy, "direct connection made");
                    status.set(true);
                    Some(socket.into())
                }
                Err(err) => {
                    debug!(%buddy, %err, "direct connection failed");
                    status.set(false);
                    stop.cancel();
                    None
                }
            }
        }));

        Ok(())
    }

    /// Take the established stream after the status flag reported success.
    pub async fn into_stream(mut self) -> Result<std::net::TcpStream, PeerError> {
        let worker = self.worker.take().ok_or(PeerError::DirectConnFailed)?;
        let stream = worker
            .await
            .expect("direct connect task panicked")
            .ok_or(PeerError::DirectConnFailed)?;
        Ok(stream)
    }
}
