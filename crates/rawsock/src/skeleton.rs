//! TCP packet descriptions and the capture matcher.

use std::net::Ipv4Addr;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::{TcpFlags, TcpPacket};
use pnet::packet::Packet;

use punch_proto::Endpoint;

/// A fully specified TCP segment to forge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSkeleton {
    pub src: Endpoint,
    pub dst: Endpoint,
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub ack_flag: bool,
    pub window: u16,
}

/// What to look for on the wire. `None` fields match anything; the SYN and
/// ACK flag booleans must match exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFilter {
    pub src_ip: Option<Ipv4Addr>,
    pub src_port: Option<u16>,
    pub dst_ip: Option<Ipv4Addr>,
    pub dst_port: Option<u16>,
    pub syn: bool,
    pub ack: bool,
}

/// The interesting fields of a matched packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedTcp {
    pub src: Endpoint,
    pub dst: Endpoint,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub payload: Vec<u8>,
}

/// Decode an Ethernet frame and check it against `filter`.
///
/// Returns `None` for anything that is not well-formed Ethernet → IPv4 → TCP
/// or that fails the match. Pure over the byte buffer, so tests can feed
/// synthetic frames.
pub fn match_frame(frame: &[u8], filter: &TcpFilter) -> Option<CapturedTcp> {
    let ethernet = EthernetPacket::new(frame)?;
    if ethernet.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }

    let ip_bytes = ethernet.payload();
    let ip = Ipv4Packet::new(ip_bytes)?;
    if ip.get_version() != 4 || ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
        return None;
    }

    // Trim to the declared total length; Ethernet pads short frames.
    let header_len = usize::from(ip.get_header_length()) * 4;
    let total_len = usize::from(ip.get_total_length());
    if header_len < 20 || total_len < header_len || ip_bytes.len() < total_len {
        return None;
    }

    let tcp = TcpPacket::new(&ip_bytes[header_len..total_len])?;
    let flags = tcp.get_flags();
    let syn = flags & TcpFlags::SYN != 0;
    let ack = flags & TcpFlags::ACK != 0;

    let matches = filter.src_ip.map_or(true, |ip_| ip_ == ip.get_source())
        && filter.dst_ip.map_or(true, |ip_| ip_ == ip.get_destination())
        && filter.src_port.map_or(true, |p| p == tcp.get_source())
        && filter.dst_port.map_or(true, |p| p == tcp.get_destination())
        && syn == filter.syn
        && ack == filter.ack;

    if !matches {
        return None;
    }

    Some(CapturedTcp {
        src: Endpoint::new(ip.get_source(), tcp.get_source()),
        dst: Endpoint::new(ip.get_destination(), tcp.get_destination()),
        seq: tcp.get_sequence(),
        ack: tcp.get_acknowledgement(),
        window: tcp.get_window(),
        payload: tcp.payload().to_vec(),
    })
}
