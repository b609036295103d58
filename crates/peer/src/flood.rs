//! Birthday floods.
//!
//! By the birthday bound, 502 probes with uniformly random ports give a
//! colliding (source, guessed-destination) pair with high probability, which
//! is what lets one NAT mapping line up with the other side's guesses.

use std::net::Ipv4Addr;

use tracing::debug;

use punch_proto::Endpoint;
use punch_rawsock::{PacketIo, RawError, TcpSkeleton};

use crate::direct::{TTL_OK, TTL_TOO_LOW};

/// Number of packets per flood.
pub const FLOOD_COUNT: usize = 502;

/// TCP window advertised by flood packets.
pub const FLOOD_WINDOW: u16 = 0x6815;

/// A random port, never zero.
fn random_port() -> u16 {
    fastrand::u16(1..=u16::MAX)
}

/// Flood SYNs from random source ports toward the buddy's external endpoint.
///
/// Every packet carries the same `seq` (the buddy's forged SYN/ACKs will ack
/// it) and a too-low TTL: the probes exist only to open state entries in
/// *our* NAT and must die before the buddy's NAT could answer them.
pub fn syn_flood(
    io: &dyn PacketIo,
    src_ip: Ipv4Addr,
    buddy: Endpoint,
    seq: u32,
) -> Result<(), RawError> {
    debug!(%buddy, seq, "flooding SYNs");

    for _ in 0..FLOOD_COUNT {
        let skeleton = TcpSkeleton {
            src: Endpoint::new(src_ip, random_port()),
            dst: buddy,
            seq,
            ack: 0,
            syn: true,
            ack_flag: false,
            window: FLOOD_WINDOW,
        };
        io.inject(&skeleton, &[], TTL_TOO_LOW as u8)?;
    }

    Ok(())
}

/// Flood SYN/ACKs at random ports on the buddy's external address.
///
/// Sent at normal TTL from our established local endpoint, acking
/// `flood_seq + 1`. Each packet carries its own destination port as a
/// two-byte payload: the buddy cannot see which external port a surviving
/// packet was aimed at (its NAT rewrote it), so the answer rides inside.
pub fn syn_ack_flood(
    io: &dyn PacketIo,
    src: Endpoint,
    buddy_ip: Ipv4Addr,
    flood_seq: u32,
) -> Result<(), RawError> {
    let seq = fastrand::u32(..);
    let ack = flood_seq.wrapping_add(1);

    debug!(%buddy_ip, ack, "flooding SYN/ACKs");

    for _ in 0..FLOOD_COUNT {
        let dst_port = random_port();
        let skeleton = TcpSkeleton {
            src,
            dst: Endpoint::new(buddy_ip, dst_port),
            seq,
            ack,
            syn: true,
            ack_flag: true,
            window: FLOOD_WINDOW,
        };
        io.inject(&skeleton, &dst_port.to_be_bytes(), TTL_OK as u8)?;
    }

    Ok(())
}
