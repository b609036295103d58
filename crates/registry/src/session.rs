//! Helper-side session records.

use punch_proto::{BuddyId, Endpoint, PortAlloc};

use crate::flag::SetOnce;

/// Everything the helper tracks about one accepted peer connection.
///
/// The observed endpoint is fixed at accept time and keys the session in the
/// registry. Every other field is a monotonic set-once cell: written by the
/// session's own worker, read by the paired session's worker after it has
/// looked this record up. Readers only touch a field after observing it set,
/// so no value ever changes under them.
#[derive(Debug)]
pub struct Session {
    observed: Endpoint,

    /// The peer's internal endpoint, from HELLO.
    pub peer: SetOnce<Endpoint>,
    /// The buddy identity the peer advertised, from HELLO.
    pub buddy: SetOnce<BuddyId>,
    /// Port-allocation class, decided after the second connection.
    pub alloc: SetOnce<PortAlloc>,
    /// Predicted external port. Set to [`punch_proto::PORT_UNKNOWN`] for a
    /// random NAT so waiters proceed to the birthday sub-protocol.
    pub ext_port: SetOnce<u16>,
    /// Sequence number of the peer's SYN toward its buddy.
    pub syn_seq: SetOnce<u32>,
    /// Sequence number the peer used in its birthday SYN flood.
    pub bday_seq: SetOnce<u32>,
    /// External port a birthday flood proved open.
    pub bday_port: SetOnce<u16>,
}

impl Session {
    pub fn new(observed: Endpoint) -> Self {
        Self {
            observed,
            peer: SetOnce::new(),
            buddy: SetOnce::new(),
            alloc: SetOnce::new(),
            ext_port: SetOnce::new(),
            syn_seq: SetOnce::new(),
            bday_seq: SetOnce::new(),
            bday_port: SetOnce::new(),
        }
    }

    /// The source address and port the helper saw on accept.
    pub fn observed(&self) -> Endpoint {
        self.observed
    }

    /// Structural buddy match: does this session look like the buddy that
    /// `wanted` describes? Only meaningful once HELLO has been recorded.
    pub fn matches_buddy(&self, wanted: &BuddyId) -> bool {
        let Some(peer) = self.peer.get() else {
            return false;
        };

        self.observed.ip == wanted.ext_ip
            && peer.ip == wanted.int_ip
            && peer.port == wanted.int_port
    }
}
