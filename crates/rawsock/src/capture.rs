//! Promiscuous Ethernet capture.

use std::io;
use std::time::Duration;

use pnet::datalink::{self, Channel, NetworkInterface};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::skeleton::{match_frame, CapturedTcp, TcpFilter};
use crate::RawError;

/// How long a single read may block before the stop token is polled again.
const READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Open `interface` promiscuously and block until a frame matches `filter`.
///
/// The loop re-checks `stop` between packet receptions; a fired token turns
/// into [`RawError::Stopped`]. Meant to run on a dedicated blocking thread.
pub fn wait_for_tcp(
    interface: &NetworkInterface,
    filter: &TcpFilter,
    stop: &CancellationToken,
) -> Result<CapturedTcp, RawError> {
    let config = datalink::Config {
        promiscuous: true,
        read_timeout: Some(READ_TIMEOUT),
        ..Default::default()
    };

    let (_tx, mut rx) = match datalink::channel(interface, config)? {
        Channel::Ethernet(tx, rx) => (tx, rx),
        _ => return Err(RawError::NotEthernet(interface.name.clone())),
    };

    debug!(device = %interface.name, ?filter, "capture started");

    while !stop.is_cancelled() {
        match rx.next() {
            Ok(frame) => {
                if let Some(captured) = match_frame(frame, filter) {
                    trace!(src = %captured.src, dst = %captured.dst, "matched packet");
                    return Ok(captured);
                }
            }
            // A read timeout just means nothing arrived; go around and poll
            // the stop token.
            Err(err) if err.kind() == io::ErrorKind::TimedOut => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err.into()),
        }
    }

    debug!(device = %interface.name, "capture stopped before a match");
    Err(RawError::Stopped)
}
