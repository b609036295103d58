//! Bound-port socket plumbing.
//!
//! The protocol depends on *which* local ports connections originate from:
//! the two helper connections must come from adjacent ports just below the
//! buddy port. Plain connect() with an ephemeral source port would destroy
//! the adjacency, so every socket here is bound explicitly before dialing.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use socket2::{Domain, Socket, Type};
use tokio::net::TcpStream;

use punch_proto::Endpoint;

/// Create a TCP socket bound to `port` on all interfaces.
pub fn bind_tcp(port: u16) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    Ok(socket)
}

/// Connect a pre-bound socket and hand it to tokio.
///
/// The connect itself runs on a blocking thread; the stream comes back
/// non-blocking and registered with the runtime.
pub async fn connect_from(socket: Socket, remote: Endpoint) -> io::Result<TcpStream> {
    let addr = SocketAddr::from((remote.ip, remote.port));

    let stream = tokio::task::spawn_blocking(move || -> io::Result<std::net::TcpStream> {
        socket.connect(&addr.into())?;
        Ok(socket.into())
    })
    .await
    .expect("connect task panicked")?;

    stream.set_nonblocking(true)?;
    TcpStream::from_std(stream)
}
