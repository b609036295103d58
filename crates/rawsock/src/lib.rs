//! Raw packet capture and injection.
//!
//! Everything the traversal needs below the kernel TCP stack lives here:
//! forging SYN and SYN/ACK segments with chosen addresses, sequence numbers
//! and TTLs, and watching the wire for specific TCP packets. The surface is
//! a single small trait, [`PacketIo`], so the state machines can be tested
//! against synthetic packets instead of a NIC.
//!
//! Only Ethernet link layers are supported.

use std::io;
use std::sync::Mutex;

use pnet::datalink::{self, NetworkInterface};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::transport::{self, TransportChannelType, TransportSender};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod capture;
mod forge;
mod skeleton;

pub use forge::build_ipv4_tcp;
pub use skeleton::{match_frame, CapturedTcp, TcpFilter, TcpSkeleton};

/// Buffer size handed to the transport channel.
const TRANSPORT_BUFFER: usize = 4096;

/// An error in the raw packet subsystem.
#[derive(Error, Debug)]
pub enum RawError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("no usable non-loopback network device found")]
    NoDevice,

    #[error("network device {0:?} does not exist")]
    UnknownDevice(String),

    /// The platform handed back something other than an Ethernet channel.
    #[error("device {0:?} is not an Ethernet device")]
    NotEthernet(String),

    /// The stop flag fired before a matching packet arrived.
    #[error("capture stopped before a matching packet arrived")]
    Stopped,
}

/// Capture and injection operations, mockable for tests.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
pub trait PacketIo: Send + Sync {
    /// Build the described segment (plus optional payload) and put it on the
    /// wire with the given IP TTL.
    fn inject(&self, skeleton: &TcpSkeleton, payload: &[u8], ttl: u8) -> Result<(), RawError>;

    /// Block until a TCP packet matching `filter` is captured, the stop
    /// token fires, or the capture fails.
    fn wait_for_tcp(
        &self,
        filter: &TcpFilter,
        stop: &CancellationToken,
    ) -> Result<CapturedTcp, RawError>;
}

/// [`PacketIo`] against a real network device.
pub struct DeviceIo {
    interface: NetworkInterface,
    // The raw IPv4 sender is stateful; injection from concurrent floods is
    // serialized here.
    sender: Mutex<TransportSender>,
}

impl DeviceIo {
    /// Open the named device for capture and raw IPv4 injection.
    ///
    /// Requires CAP_NET_RAW (or root).
    pub fn open(device: &str) -> Result<Self, RawError> {
        let interface = interface_by_name(device)?;

        let channel_type = TransportChannelType::Layer3(IpNextHeaderProtocols::Tcp);
        let (sender, _receiver) = transport::transport_channel(TRANSPORT_BUFFER, channel_type)?;

        Ok(Self {
            interface,
            sender: Mutex::new(sender),
        })
    }

    pub fn device(&self) -> &str {
        &self.interface.name
    }
}

impl PacketIo for DeviceIo {
    fn inject(&self, skeleton: &TcpSkeleton, payload: &[u8], ttl: u8) -> Result<(), RawError> {
        let packet = build_ipv4_tcp(skeleton, payload, ttl);
        let ip = Ipv4Packet::new(&packet).expect("built packet is well-formed");

        let mut sender = self.sender.lock().expect("transport sender mutex");
        sender.send_to(ip, skeleton.dst.ip.into())?;

        Ok(())
    }

    fn wait_for_tcp(
        &self,
        filter: &TcpFilter,
        stop: &CancellationToken,
    ) -> Result<CapturedTcp, RawError> {
        capture::wait_for_tcp(&self.interface, filter, stop)
    }
}

/// Pick the first usable capture device: up, not loopback, with an address.
pub fn default_device() -> Result<String, RawError> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.is_up() && !iface.is_loopback() && !iface.ips.is_empty())
        .map(|iface| iface.name)
        .ok_or(RawError::NoDevice)
}

fn interface_by_name(device: &str) -> Result<NetworkInterface, RawError> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == device)
        .ok_or_else(|| RawError::UnknownDevice(device.to_string()))
}
