//! The `connect_with` entry point over real sockets.
//!
//! A scripted helper listens on loopback and checks that the peer's two
//! helper connections really originate from the adjacent ports just below
//! the buddy port.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use punch_peer::{connect_with, PeerConfig, PeerError};
use punch_proto::{
    frame::{read_message, write_message},
    BuddyId, Endpoint, Message, MessageKind, PortAlloc,
};
use punch_rawsock::{MockPacketIo, PacketIo};

async fn send(stream: &mut TcpStream, msg: Message) {
    write_message(stream, &msg).await.expect("script send");
}

async fn recv(stream: &mut TcpStream, kind: MessageKind) -> Message {
    read_message(stream, kind).await.expect("script recv")
}

#[tokio::test]
async fn binds_the_adjacent_helper_ports_and_honors_unsupported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let helper_port = listener.local_addr().unwrap().port();

    let local_port = fastrand::u16(20000..40000);
    let config = PeerConfig {
        helper: Endpoint::new(Ipv4Addr::LOCALHOST, helper_port),
        local: Endpoint::new(Ipv4Addr::LOCALHOST, local_port),
        buddy: BuddyId {
            ext_ip: Ipv4Addr::new(5, 6, 7, 8),
            int_ip: Ipv4Addr::new(10, 0, 1, 2),
            int_port: 51000,
        },
        device: None,
        pretend_random: false,
    };

    // No raw traffic happens before the topology check fails.
    let io: Arc<dyn PacketIo> = Arc::new(MockPacketIo::new());
    let peer = tokio::spawn(connect_with(config, io));

    // First connection: the persistent one, from two below the buddy port.
    let (mut main, main_addr) = listener.accept().await.unwrap();
    assert_eq!(main_addr.port(), local_port - 2);

    let Message::Hello { peer: internal, .. } = recv(&mut main, MessageKind::Hello).await else {
        unreachable!()
    };
    assert_eq!(internal, Endpoint::new(Ipv4Addr::LOCALHOST, local_port));
    send(&mut main, Message::ConnectAgain).await;

    // Second connection: the prediction probe, from one below the buddy
    // port.
    let (_probe, probe_addr) = listener.accept().await.unwrap();
    assert_eq!(probe_addr.port(), local_port - 1);

    recv(&mut main, MessageKind::ConnectedAgain).await;
    send(
        &mut main,
        Message::PortPred {
            alloc: PortAlloc::Random,
        },
    )
    .await;

    recv(&mut main, MessageKind::WaitingForBuddyAlloc).await;
    send(
        &mut main,
        Message::BuddyAlloc {
            alloc: PortAlloc::Random,
            supported: false,
        },
    )
    .await;

    assert!(matches!(
        peer.await.unwrap(),
        Err(PeerError::Unsupported)
    ));
}

#[tokio::test]
async fn pretending_random_shifts_the_persistent_port() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let helper_port = listener.local_addr().unwrap().port();

    let local_port = fastrand::u16(20000..40000);
    let config = PeerConfig {
        helper: Endpoint::new(Ipv4Addr::LOCALHOST, helper_port),
        local: Endpoint::new(Ipv4Addr::LOCALHOST, local_port),
        buddy: BuddyId {
            ext_ip: Ipv4Addr::new(5, 6, 7, 8),
            int_ip: Ipv4Addr::new(10, 0, 1, 2),
            int_port: 51000,
        },
        device: None,
        pretend_random: true,
    };

    let io: Arc<dyn PacketIo> = Arc::new(MockPacketIo::new());
    let peer = tokio::spawn(connect_with(config, io));

    // The persistent port steps one lower so the helper cannot see an
    // adjacent pair and classifies the peer as random.
    let (mut main, main_addr) = listener.accept().await.unwrap();
    assert_eq!(main_addr.port(), local_port - 3);

    recv(&mut main, MessageKind::Hello).await;
    // Close the helper side; the peer unwinds with an i/o error.
    drop(main);
    drop(listener);

    assert!(matches!(
        peer.await.unwrap(),
        Err(PeerError::Frame(_) | PeerError::Io(_))
    ));
}
