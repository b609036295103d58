//! Raw IPv4/TCP segment construction.

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpFlags};

use crate::skeleton::TcpSkeleton;

const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;

/// Fixed IPv4 identification carried by every forged packet.
const IP_ID: u16 = 242;

/// Build a complete IPv4 packet for the given segment description.
///
/// TOS 0, identification 242, no fragmentation, no IP or TCP options, both
/// checksums computed. The caller chooses the TTL: a deliberately low value
/// lets the packet open NAT state and die mid-path before the far end could
/// answer with an RST.
pub fn build_ipv4_tcp(skeleton: &TcpSkeleton, payload: &[u8], ttl: u8) -> Vec<u8> {
    let tcp_len = TCP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + tcp_len;

    let mut tcp_buf = vec![0u8; tcp_len];
    {
        let mut tcp_packet =
            MutableTcpPacket::new(&mut tcp_buf).expect("buffer sized for the TCP header");
        tcp_packet.set_source(skeleton.src.port);
        tcp_packet.set_destination(skeleton.dst.port);
        tcp_packet.set_sequence(skeleton.seq);
        tcp_packet.set_acknowledgement(skeleton.ack);
        tcp_packet.set_data_offset((TCP_HEADER_LEN / 4) as u8);
        tcp_packet.set_reserved(0);

        let mut flags = 0;
        if skeleton.syn {
            flags |= TcpFlags::SYN;
        }
        if skeleton.ack_flag {
            flags |= TcpFlags::ACK;
        }
        tcp_packet.set_flags(flags);

        tcp_packet.set_window(skeleton.window);
        tcp_packet.set_urgent_ptr(0);
        tcp_packet.set_payload(payload);

        let checksum =
            tcp::ipv4_checksum(&tcp_packet.to_immutable(), &skeleton.src.ip, &skeleton.dst.ip);
        tcp_packet.set_checksum(checksum);
    }

    let mut buf = vec![0u8; total_len];
    {
        let mut ip_packet =
            MutableIpv4Packet::new(&mut buf).expect("buffer sized for the IPv4 header");
        ip_packet.set_version(4);
        ip_packet.set_header_length((IPV4_HEADER_LEN / 4) as u8);
        ip_packet.set_dscp(0);
        ip_packet.set_ecn(0);
        ip_packet.set_total_length(total_len as u16);
        ip_packet.set_identification(IP_ID);
        ip_packet.set_flags(0);
        ip_packet.set_fragment_offset(0);
        ip_packet.set_ttl(ttl);
        ip_packet.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        ip_packet.set_source(skeleton.src.ip);
        ip_packet.set_destination(skeleton.dst.ip);
        ip_packet.set_payload(&tcp_buf);

        let checksum = ipv4::checksum(&ip_packet.to_immutable());
        ip_packet.set_checksum(checksum);
    }

    buf
}
