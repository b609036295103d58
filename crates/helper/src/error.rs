use std::io;

use thiserror::Error;

use punch_proto::FrameError;
use punch_registry::{RegistryError, WaitError};

/// Why a helper session ended early.
///
/// There is no recovery within a state: any of these unwinds the session,
/// releasing held registry references and closing the peer socket.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The connection ended before a HELLO arrived. Routine for the
    /// port-prediction second connection, which never sends one.
    #[error("connection closed before HELLO: {0}")]
    NoHello(io::Error),

    /// A framing or protocol fault on the peer connection.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The buddy session never showed up.
    #[error(transparent)]
    BuddyNotFound(#[from] RegistryError),

    /// A wait on one of the buddy's published fields expired.
    #[error("buddy field wait failed: {0}")]
    BuddyWait(#[from] WaitError),

    /// Both peers are behind randomizing NATs; the topology is rejected.
    #[error("both peers allocate ports randomly; connection unsupported")]
    Unsupported,
}
