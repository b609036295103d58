use std::io;
use std::time::Duration;

use thiserror::Error;

use punch_proto::FrameError;
use punch_rawsock::RawError;

/// Why a traversal attempt failed.
///
/// The attempt is one-shot: any of these unwinds the whole `connect` call,
/// closing every socket it opened. Retrying is the caller's business.
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A framing or protocol fault on the helper connection.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Raw capture or injection failed.
    #[error(transparent)]
    Raw(#[from] RawError),

    /// The helper rejected the pairing: both peers are behind randomizing
    /// NATs.
    #[error("unsupported topology: both peers allocate ports randomly")]
    Unsupported,

    /// The direct connection never came up.
    #[error("direct connection attempt failed")]
    DirectConnFailed,

    /// No flooded SYN/ACK made it through the NAT in time.
    #[error("no flooded SYN/ACK was captured within {0:?}")]
    BdayTimeout(Duration),

    /// A SYN/ACK matched but did not carry the expected port payload.
    #[error("flooded SYN/ACK carried a malformed payload")]
    BadFloodPayload,

    /// A capture worker died without reporting a result.
    #[error("capture worker ended unexpectedly")]
    SnifferGone,
}
