//! End-to-end session scenarios over in-memory streams.
//!
//! Each test drives one or two scripted peers against real session workers
//! sharing one registry, checking the exact message order of the protocol.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{duplex, DuplexStream};
use tokio::task::JoinHandle;

use punch_helper::{SessionError, SessionWorker, Timeouts};
use punch_proto::{
    frame::{read_message, write_message},
    BuddyId, Endpoint, Message, MessageKind, PortAlloc,
};
use punch_registry::Registry;

const A_OBSERVED: Endpoint = Endpoint {
    ip: Ipv4Addr::new(1, 2, 3, 4),
    port: 40000,
};
const B_OBSERVED: Endpoint = Endpoint {
    ip: Ipv4Addr::new(5, 6, 7, 8),
    port: 50000,
};
const A_INTERNAL: Endpoint = Endpoint {
    ip: Ipv4Addr::new(10, 0, 0, 2),
    port: 41000,
};
const B_INTERNAL: Endpoint = Endpoint {
    ip: Ipv4Addr::new(10, 0, 1, 2),
    port: 51000,
};

const A_SYN_SEQ: u32 = 0x1111_1111;
const B_SYN_SEQ: u32 = 0x2222_2222;

fn short_timeouts() -> Timeouts {
    Timeouts {
        second_conn: Duration::from_millis(200),
        buddy: Duration::from_secs(5),
    }
}

fn a_hello() -> Message {
    Message::Hello {
        peer: A_INTERNAL,
        buddy: BuddyId {
            ext_ip: B_OBSERVED.ip,
            int_ip: B_INTERNAL.ip,
            int_port: B_INTERNAL.port,
        },
    }
}

fn b_hello() -> Message {
    Message::Hello {
        peer: B_INTERNAL,
        buddy: BuddyId {
            ext_ip: A_OBSERVED.ip,
            int_ip: A_INTERNAL.ip,
            int_port: A_INTERNAL.port,
        },
    }
}

/// Spawn a session worker for `observed`, returning the scripted peer's end
/// of the stream and the worker's join handle.
fn spawn_worker(
    registry: &Arc<Registry>,
    observed: Endpoint,
) -> (DuplexStream, JoinHandle<Result<(), SessionError>>) {
    let (peer_side, helper_side) = duplex(4096);
    let worker = SessionWorker::new(helper_side, observed, registry, short_timeouts());
    (peer_side, tokio::spawn(worker.run()))
}

async fn send(stream: &mut DuplexStream, msg: Message) {
    write_message(stream, &msg).await.expect("script send");
}

async fn recv(stream: &mut DuplexStream, kind: MessageKind) -> Message {
    read_message(stream, kind).await.expect("script recv")
}

/// Drive a sequential peer through the whole protocol: HELLO, second
/// connection, buddy exchange, seq swap, goodbye.
async fn run_sequential_peer(
    mut main: DuplexStream,
    second: DuplexStream,
    hello: Message,
    my_syn_seq: u32,
    expect_buddy_port: u16,
    expect_peer_seq: u32,
) {
    send(&mut main, hello).await;
    recv(&mut main, MessageKind::ConnectAgain).await;
    send(&mut main, Message::ConnectedAgain).await;

    let Message::PortPred { alloc } = recv(&mut main, MessageKind::PortPred).await else {
        unreachable!()
    };
    assert_eq!(alloc, PortAlloc::Sequential);
    // The probe has served its purpose.
    drop(second);

    send(&mut main, Message::WaitingForBuddyAlloc).await;
    let Message::BuddyAlloc { supported, .. } = recv(&mut main, MessageKind::BuddyAlloc).await
    else {
        unreachable!()
    };
    assert!(supported);

    send(&mut main, Message::WaitingForBuddyPort).await;
    let Message::BuddyPort {
        ext_port,
        bday_needed,
    } = recv(&mut main, MessageKind::BuddyPort).await
    else {
        unreachable!()
    };
    assert_eq!(ext_port, expect_buddy_port);
    assert!(!bday_needed);

    send(&mut main, Message::BuddySynSeq { seq: my_syn_seq }).await;
    let Message::PeerSynSeq { seq } = recv(&mut main, MessageKind::PeerSynSeq).await else {
        unreachable!()
    };
    assert_eq!(seq, expect_peer_seq);

    send(&mut main, Message::Goodbye { success: true }).await;
}

#[tokio::test]
async fn happy_path_both_sequential() {
    let registry = Registry::new();

    let (a_main, a_worker) = spawn_worker(&registry, A_OBSERVED);
    let (a_second, a_probe_worker) =
        spawn_worker(&registry, Endpoint::new(A_OBSERVED.ip, A_OBSERVED.port + 1));
    let (b_main, b_worker) = spawn_worker(&registry, B_OBSERVED);
    let (b_second, b_probe_worker) =
        spawn_worker(&registry, Endpoint::new(B_OBSERVED.ip, B_OBSERVED.port + 1));

    let a_script = tokio::spawn(run_sequential_peer(
        a_main,
        a_second,
        a_hello(),
        A_SYN_SEQ,
        B_OBSERVED.port + 2,
        B_SYN_SEQ,
    ));
    let b_script = tokio::spawn(run_sequential_peer(
        b_main,
        b_second,
        b_hello(),
        B_SYN_SEQ,
        A_OBSERVED.port + 2,
        A_SYN_SEQ,
    ));

    a_script.await.unwrap();
    b_script.await.unwrap();

    a_worker.await.unwrap().expect("session A should succeed");
    b_worker.await.unwrap().expect("session B should succeed");

    // The probe sessions end once the peer closes them, without a HELLO.
    assert!(matches!(
        a_probe_worker.await.unwrap(),
        Err(SessionError::NoHello(_))
    ));
    assert!(matches!(
        b_probe_worker.await.unwrap(),
        Err(SessionError::NoHello(_))
    ));

    assert_eq!(registry.len(), 0, "no sessions may leak");
}

/// A peer that never opens a second connection and so classifies as random.
async fn run_random_peer_prologue(main: &mut DuplexStream, hello: Message) -> bool {
    send(main, hello).await;
    recv(main, MessageKind::ConnectAgain).await;
    send(main, Message::ConnectedAgain).await;

    let Message::PortPred { alloc } = recv(main, MessageKind::PortPred).await else {
        unreachable!()
    };
    assert_eq!(alloc, PortAlloc::Random);

    send(main, Message::WaitingForBuddyAlloc).await;
    let Message::BuddyAlloc { supported, .. } = recv(main, MessageKind::BuddyAlloc).await else {
        unreachable!()
    };
    supported
}

#[tokio::test]
async fn both_random_is_unsupported() {
    let registry = Registry::new();

    let (a_main, a_worker) = spawn_worker(&registry, A_OBSERVED);
    let (b_main, b_worker) = spawn_worker(&registry, B_OBSERVED);

    let a_script = tokio::spawn(async move {
        let mut main = a_main;
        assert!(!run_random_peer_prologue(&mut main, a_hello()).await);
    });
    let b_script = tokio::spawn(async move {
        let mut main = b_main;
        assert!(!run_random_peer_prologue(&mut main, b_hello()).await);
    });

    a_script.await.unwrap();
    b_script.await.unwrap();

    assert!(matches!(
        a_worker.await.unwrap(),
        Err(SessionError::Unsupported)
    ));
    assert!(matches!(
        b_worker.await.unwrap(),
        Err(SessionError::Unsupported)
    ));

    assert_eq!(registry.len(), 0, "both sessions must be released");
}

#[tokio::test]
async fn peer_random_buddy_sequential_runs_the_birthday_exchange() {
    const FLOOD_SEQ: u32 = 0x0777_0777;
    const DISCOVERED_PORT: u16 = 61000;

    let registry = Registry::new();

    let (a_main, a_worker) = spawn_worker(&registry, A_OBSERVED);
    let (b_main, b_worker) = spawn_worker(&registry, B_OBSERVED);
    let (b_second, b_probe_worker) =
        spawn_worker(&registry, Endpoint::new(B_OBSERVED.ip, B_OBSERVED.port + 1));

    // A is the random peer: it floods SYNs and discovers its own port.
    let a_script = tokio::spawn(async move {
        let mut main = a_main;
        assert!(run_random_peer_prologue(&mut main, a_hello()).await);

        send(&mut main, Message::WaitingForBuddyPort).await;
        let Message::BuddyPort {
            ext_port,
            bday_needed,
        } = recv(&mut main, MessageKind::BuddyPort).await
        else {
            unreachable!()
        };
        assert_eq!(ext_port, B_OBSERVED.port + 2);
        assert!(bday_needed);

        send(&mut main, Message::SynFlooded { seq: FLOOD_SEQ }).await;
        recv(&mut main, MessageKind::BuddySynAckFlooded).await;
        send(
            &mut main,
            Message::BdaySuccessPort {
                port: DISCOVERED_PORT,
            },
        )
        .await;

        let Message::BuddyPort {
            ext_port,
            bday_needed,
        } = recv(&mut main, MessageKind::BuddyPort).await
        else {
            unreachable!()
        };
        assert_eq!(ext_port, B_OBSERVED.port + 2);
        assert!(!bday_needed);

        send(&mut main, Message::BuddySynSeq { seq: A_SYN_SEQ }).await;
        let Message::PeerSynSeq { seq } = recv(&mut main, MessageKind::PeerSynSeq).await else {
            unreachable!()
        };
        assert_eq!(seq, B_SYN_SEQ);

        send(&mut main, Message::Goodbye { success: true }).await;
    });

    // B is sequential and helps by flooding SYN/ACKs.
    let b_script = tokio::spawn(async move {
        let mut main = b_main;
        send(&mut main, b_hello()).await;
        recv(&mut main, MessageKind::ConnectAgain).await;
        send(&mut main, Message::ConnectedAgain).await;

        let Message::PortPred { alloc } = recv(&mut main, MessageKind::PortPred).await else {
            unreachable!()
        };
        assert_eq!(alloc, PortAlloc::Sequential);
        drop(b_second);

        send(&mut main, Message::WaitingForBuddyAlloc).await;
        let Message::BuddyAlloc { alloc, supported } =
            recv(&mut main, MessageKind::BuddyAlloc).await
        else {
            unreachable!()
        };
        assert_eq!(alloc, PortAlloc::Random);
        assert!(supported);

        send(&mut main, Message::WaitingForBuddyPort).await;
        let Message::BuddyPort {
            ext_port,
            bday_needed,
        } = recv(&mut main, MessageKind::BuddyPort).await
        else {
            unreachable!()
        };
        // The random buddy's port is not known yet.
        assert_eq!(ext_port, 0);
        assert!(bday_needed);

        send(&mut main, Message::WaitingToSynAckFlood).await;
        let Message::SynAckFloodSeqNum { seq } =
            recv(&mut main, MessageKind::SynAckFloodSeqNum).await
        else {
            unreachable!()
        };
        assert_eq!(seq, FLOOD_SEQ);

        send(&mut main, Message::SynAckFloodDone).await;
        let Message::BuddyPort {
            ext_port,
            bday_needed,
        } = recv(&mut main, MessageKind::BuddyPort).await
        else {
            unreachable!()
        };
        assert_eq!(ext_port, DISCOVERED_PORT);
        assert!(!bday_needed);

        send(&mut main, Message::BuddySynSeq { seq: B_SYN_SEQ }).await;
        let Message::PeerSynSeq { seq } = recv(&mut main, MessageKind::PeerSynSeq).await else {
            unreachable!()
        };
        assert_eq!(seq, A_SYN_SEQ);

        send(&mut main, Message::Goodbye { success: true }).await;
    });

    a_script.await.unwrap();
    b_script.await.unwrap();

    a_worker.await.unwrap().expect("session A should succeed");
    b_worker.await.unwrap().expect("session B should succeed");
    assert!(matches!(
        b_probe_worker.await.unwrap(),
        Err(SessionError::NoHello(_))
    ));

    assert_eq!(registry.len(), 0);
}

#[tokio::test]
async fn missing_buddy_times_out_without_leaks() {
    let registry = Registry::new();

    let (mut a_main, a_worker) = spawn_worker(&registry, A_OBSERVED);
    let (a_second, a_probe_worker) =
        spawn_worker(&registry, Endpoint::new(A_OBSERVED.ip, A_OBSERVED.port + 1));

    send(&mut a_main, a_hello()).await;
    recv(&mut a_main, MessageKind::ConnectAgain).await;
    send(&mut a_main, Message::ConnectedAgain).await;
    recv(&mut a_main, MessageKind::PortPred).await;
    drop(a_second);
    send(&mut a_main, Message::WaitingForBuddyAlloc).await;

    // No buddy ever connects; the worker's registry search expires.
    assert!(matches!(
        a_worker.await.unwrap(),
        Err(SessionError::BuddyNotFound(_))
    ));
    assert!(matches!(
        a_probe_worker.await.unwrap(),
        Err(SessionError::NoHello(_))
    ));
    assert_eq!(registry.len(), 0);
}

#[tokio::test]
async fn oversized_hello_is_fatal() {
    use tokio::io::AsyncWriteExt;

    let registry = Registry::new();
    let (mut a_main, a_worker) = spawn_worker(&registry, A_OBSERVED);

    // A crafted header declaring a 65535-byte HELLO.
    let mut header = Vec::new();
    header.extend_from_slice(&MessageKind::Hello.tag().to_be_bytes());
    header.extend_from_slice(&65535u32.to_be_bytes());
    a_main.write_all(&header).await.unwrap();

    assert!(matches!(
        a_worker.await.unwrap(),
        Err(SessionError::Frame(
            punch_proto::FrameError::PayloadTooLarge { len: 65535 }
        ))
    ));
    assert_eq!(registry.len(), 0);
}

#[tokio::test]
async fn out_of_order_message_is_fatal() {
    let registry = Registry::new();
    let (mut a_main, a_worker) = spawn_worker(&registry, A_OBSERVED);

    // GOODBYE where HELLO is expected.
    send(&mut a_main, Message::Goodbye { success: true }).await;

    assert!(matches!(
        a_worker.await.unwrap(),
        Err(SessionError::Frame(
            punch_proto::FrameError::UnexpectedType { .. }
        ))
    ));
    assert_eq!(registry.len(), 0);
}
