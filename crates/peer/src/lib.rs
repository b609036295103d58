//! The NATed peer.
//!
//! One call, [`connect`], runs the whole traversal: it binds the three
//! local ports the protocol depends on, talks the helper through the state
//! machine, performs the raw-socket work (SYN capture, birthday floods, the
//! forged SYN/ACK), and hands back an ordinary connected TCP stream to the
//! buddy. The helper never sees a byte of what flows on that stream.
//!
//! Raw capture and injection need CAP_NET_RAW, and the link layer must be
//! Ethernet.

use std::sync::Arc;

use tracing::info;

use punch_proto::{port_add, BuddyId, Endpoint};
use punch_rawsock::{default_device, DeviceIo, PacketIo};

pub mod direct;
mod error;
pub mod flood;
pub mod fsm;
pub mod sockets;

pub use direct::DirectConn;
pub use error::PeerError;
pub use fsm::PeerFsm;

/// Everything a traversal attempt needs to know.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// The helper's public endpoint.
    pub helper: Endpoint,
    /// Our internal address and the port the buddy socket binds to.
    pub local: Endpoint,
    /// Who we are trying to reach.
    pub buddy: BuddyId,
    /// Capture/injection device; autodetected when `None`.
    pub device: Option<String>,
    /// Developer switch: bind the persistent helper port one step lower so
    /// the helper classifies this peer as random.
    pub pretend_random: bool,
}

impl PeerConfig {
    /// Port for the persistent helper connection. Two below the buddy port,
    /// or three below when simulating a random NAT; the skipped step keeps
    /// the adjacency the helper's second-connection probe relies on.
    pub fn helper_port(&self) -> u16 {
        let delta = if self.pretend_random { -3 } else { -2 };
        port_add(self.local.port, delta)
    }

    /// Port for the second, port-prediction connection: one below the buddy
    /// port.
    pub fn prediction_port(&self) -> u16 {
        port_add(self.local.port, -1)
    }
}

/// Establish a direct TCP connection to the buddy through both NATs.
///
/// Returns the connected buddy socket on success. One-shot: any failure
/// unwinds the attempt and closes every socket it opened.
pub async fn connect(config: PeerConfig) -> Result<std::net::TcpStream, PeerError> {
    let device = match &config.device {
        Some(device) => device.clone(),
        None => default_device()?,
    };
    info!(%device, "using capture device");

    let io: Arc<dyn PacketIo> = Arc::new(DeviceIo::open(&device)?);
    connect_with(config, io).await
}

/// [`connect`] with the raw-packet surface supplied by the caller.
pub async fn connect_with(
    config: PeerConfig,
    io: Arc<dyn PacketIo>,
) -> Result<std::net::TcpStream, PeerError> {
    info!(
        local = %config.local,
        buddy = %config.buddy,
        helper = %config.helper,
        "starting traversal attempt"
    );

    let direct = DirectConn::bind(config.local.port)?;
    let helper_socket = sockets::bind_tcp(config.helper_port())?;
    let prediction_socket = sockets::bind_tcp(config.prediction_port())?;

    let helper = config.helper;
    let stream = sockets::connect_from(helper_socket, helper).await?;

    let fsm = PeerFsm::new(stream, config, io, direct);
    fsm.run(move || sockets::connect_from(prediction_socket, helper))
        .await
}
