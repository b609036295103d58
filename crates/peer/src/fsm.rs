//! The peer's side of the protocol.
//!
//! Runs sequentially over the persistent helper connection, spawning
//! blocking workers for the capture loops and the staged connect. The state
//! order mirrors the helper exactly; every read names the one message that
//! may arrive next.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use punch_proto::{
    frame::{read_message, write_message},
    Endpoint, Message, MessageKind, PortAlloc,
};
use punch_rawsock::{CapturedTcp, PacketIo, RawError, TcpFilter, TcpSkeleton};

use crate::direct::{DirectConn, DIRECT_CONN_TIMEOUT, TTL_OK};
use crate::error::PeerError;
use crate::flood;
use crate::PeerConfig;

/// How long to wait for the SYN/ACK capture worker after the helper says the
/// buddy has flooded.
const FIND_SYN_ACK_TIMEOUT: Duration = Duration::from_secs(20);

/// The peer state machine over an established helper connection.
pub struct PeerFsm<S> {
    stream: S,
    config: PeerConfig,
    io: Arc<dyn PacketIo>,
    direct: DirectConn,
    /// Our class, as told by the helper in PORT_PRED.
    alloc: Option<PortAlloc>,
    /// The buddy's external port, updated by every BUDDY_PORT message.
    buddy_ext_port: u16,
    /// Our internal buddy-facing port; moves when a birthday attempt
    /// rebinds the socket.
    local_port: u16,
}

impl<S> PeerFsm<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, config: PeerConfig, io: Arc<dyn PacketIo>, direct: DirectConn) -> Self {
        let local_port = config.local.port;
        Self {
            stream,
            config,
            io,
            direct,
            alloc: None,
            buddy_ext_port: 0,
            local_port,
        }
    }

    /// Run the whole protocol. `dial_second` opens the port-prediction
    /// connection when the helper asks for it.
    ///
    /// Returns the direct, connected socket to the buddy.
    pub async fn run<S2, F, Fut>(mut self, dial_second: F) -> Result<std::net::TcpStream, PeerError>
    where
        S2: AsyncRead + AsyncWrite + Unpin + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = io::Result<S2>> + Send,
    {
        self.hello(dial_second).await?;
        self.buddy_alloc().await?;

        // BUDDY_PORT re-enters after a birthday round; the helper resends
        // the message with the final port and bday_needed cleared.
        loop {
            let msg = read_message(&mut self.stream, MessageKind::BuddyPort).await?;
            let Message::BuddyPort {
                ext_port,
                bday_needed,
            } = msg
            else {
                unreachable!("read_message returns the expected kind");
            };
            debug!(ext_port, bday_needed, "received BUDDY_PORT");
            self.buddy_ext_port = ext_port;

            if !bday_needed {
                break;
            }
            match self.alloc {
                Some(PortAlloc::Sequential) => self.reply_bday().await?,
                _ => self.start_bday().await?,
            }
        }

        self.direct_conn().await
    }

    /// States 1 and 2: HELLO and the second helper connection.
    async fn hello<S2, F, Fut>(&mut self, dial_second: F) -> Result<(), PeerError>
    where
        S2: AsyncRead + AsyncWrite + Unpin + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = io::Result<S2>> + Send,
    {
        write_message(
            &mut self.stream,
            &Message::Hello {
                peer: self.config.local,
                buddy: self.config.buddy,
            },
        )
        .await?;
        debug!("sent HELLO");

        read_message(&mut self.stream, MessageKind::ConnectAgain).await?;
        debug!("received CONNECT_AGAIN");

        // The second connection exists only so the helper can watch which
        // source port the NAT gives it.
        let second = dial_second().await?;
        write_message(&mut self.stream, &Message::ConnectedAgain).await?;
        debug!("sent CONNECTED_AGAIN");

        let msg = read_message(&mut self.stream, MessageKind::PortPred).await?;
        let Message::PortPred { alloc } = msg else {
            unreachable!("read_message returns the expected kind");
        };
        info!(%alloc, "helper classified our NAT");
        self.alloc = Some(alloc);
        drop(second);

        Ok(())
    }

    /// State 3: learn the buddy's class and whether to continue at all.
    async fn buddy_alloc(&mut self) -> Result<(), PeerError> {
        write_message(&mut self.stream, &Message::WaitingForBuddyAlloc).await?;
        debug!("sent WAITING_FOR_BUDDY_ALLOC");

        let msg = read_message(&mut self.stream, MessageKind::BuddyAlloc).await?;
        let Message::BuddyAlloc { alloc, supported } = msg else {
            unreachable!("read_message returns the expected kind");
        };
        debug!(buddy_alloc = %alloc, supported, "received BUDDY_ALLOC");

        if !supported {
            warn!("helper rejected the pairing");
            return Err(PeerError::Unsupported);
        }

        write_message(&mut self.stream, &Message::WaitingForBuddyPort).await?;
        debug!("sent WAITING_FOR_BUDDY_PORT");

        Ok(())
    }

    /// State 6: this peer is random. Flood SYNs, then wait for one of the
    /// buddy's SYN/ACKs to slip through and reveal our mapping.
    async fn start_bday(&mut self) -> Result<(), PeerError> {
        let buddy = Endpoint::new(self.config.buddy.ext_ip, self.buddy_ext_port);
        let seq = fastrand::u32(..);

        let io = self.io.clone();
        let src_ip = self.config.local.ip;
        tokio::task::spawn_blocking(move || flood::syn_flood(&*io, src_ip, buddy, seq))
            .await
            .expect("flood task panicked")?;

        // Any SYN/ACK from the buddy's endpoint to any of our ports will do;
        // the destination port is exactly what we are trying to learn.
        let filter = TcpFilter {
            src_ip: Some(buddy.ip),
            src_port: Some(buddy.port),
            dst_ip: Some(self.config.local.ip),
            dst_port: None,
            syn: true,
            ack: true,
        };
        let stop = CancellationToken::new();
        let (sniffer, results) = spawn_sniffer(self.io.clone(), filter, stop.clone());

        write_message(&mut self.stream, &Message::SynFlooded { seq }).await?;
        debug!(seq, "sent SYN_FLOODED");

        read_message(&mut self.stream, MessageKind::BuddySynAckFlooded).await?;
        debug!("received BUDDY_SYN_ACK_FLOODED");

        let captured = match tokio::time::timeout(FIND_SYN_ACK_TIMEOUT, results.recv_async()).await
        {
            Ok(Ok(Ok(captured))) => captured,
            Ok(Ok(Err(err))) => return Err(err.into()),
            Ok(Err(_)) => return Err(PeerError::SnifferGone),
            Err(_) => {
                stop.cancel();
                let _ = sniffer.await;
                return Err(PeerError::BdayTimeout(FIND_SYN_ACK_TIMEOUT));
            }
        };
        let _ = sniffer.await;

        // The payload names the external port the buddy aimed at; the
        // destination port is the internal port our NAT mapped it to.
        let ext_port: [u8; 2] = captured
            .payload
            .as_slice()
            .try_into()
            .map_err(|_| PeerError::BadFloodPayload)?;
        let ext_port = u16::from_be_bytes(ext_port);

        info!(
            ext_port,
            int_port = captured.dst.port,
            "birthday attempt found a surviving mapping"
        );

        self.direct.rebind(captured.dst.port)?;
        self.local_port = captured.dst.port;

        write_message(&mut self.stream, &Message::BdaySuccessPort { port: ext_port }).await?;
        debug!(port = ext_port, "sent BDAY_SUCCESS_PORT");

        Ok(())
    }

    /// State 7: the buddy is random; help it by flooding SYN/ACKs at
    /// guessed ports.
    async fn reply_bday(&mut self) -> Result<(), PeerError> {
        write_message(&mut self.stream, &Message::WaitingToSynAckFlood).await?;
        debug!("sent WAITING_TO_SYN_ACK_FLOOD");

        let msg = read_message(&mut self.stream, MessageKind::SynAckFloodSeqNum).await?;
        let Message::SynAckFloodSeqNum { seq } = msg else {
            unreachable!("read_message returns the expected kind");
        };
        debug!(seq, "received SYN_ACK_FLOOD_SEQ_NUM");

        let io = self.io.clone();
        let src = Endpoint::new(self.config.local.ip, self.local_port);
        let buddy_ip = self.config.buddy.ext_ip;
        tokio::task::spawn_blocking(move || flood::syn_ack_flood(&*io, src, buddy_ip, seq))
            .await
            .expect("flood task panicked")?;

        write_message(&mut self.stream, &Message::SynAckFloodDone).await?;
        debug!("sent SYN_ACK_FLOOD_DONE");

        Ok(())
    }

    /// State 5: the direct attempt. Capture our own SYN, swap sequence
    /// numbers through the helper, forge the answering SYN/ACK.
    async fn direct_conn(mut self) -> Result<std::net::TcpStream, PeerError> {
        let buddy = Endpoint::new(self.config.buddy.ext_ip, self.buddy_ext_port);

        // Watch for the SYN our own kernel is about to emit.
        let filter = TcpFilter {
            src_ip: Some(self.config.local.ip),
            src_port: Some(self.local_port),
            dst_ip: Some(buddy.ip),
            dst_port: Some(buddy.port),
            syn: true,
            ack: false,
        };
        let (sniffer, results) = spawn_sniffer(self.io.clone(), filter, self.direct.capture_stop());

        self.direct.start(buddy)?;

        let captured = match tokio::time::timeout(DIRECT_CONN_TIMEOUT, results.recv_async()).await {
            Ok(Ok(Ok(captured))) => captured,
            Ok(Ok(Err(err))) => return self.fail_goodbye(err.into()).await,
            Ok(Err(_)) => return self.fail_goodbye(PeerError::SnifferGone).await,
            Err(_) => return self.fail_goodbye(PeerError::DirectConnFailed).await,
        };
        let _ = sniffer.await;
        debug!(seq = captured.seq, "captured our SYN to the buddy");

        write_message(&mut self.stream, &Message::BuddySynSeq { seq: captured.seq }).await?;
        debug!("sent BUDDY_SYN_SEQ");

        let msg = read_message(&mut self.stream, MessageKind::PeerSynSeq).await?;
        let Message::PeerSynSeq { seq: buddy_seq } = msg else {
            unreachable!("read_message returns the expected kind");
        };
        debug!(seq = buddy_seq, "received PEER_SYN_SEQ");

        // The forged SYN/ACK is the captured SYN with the ACK side filled
        // in: from the buddy's point of view it completes the handshake of
        // *its* outstanding SYN. Emitted once; a lost packet fails the
        // attempt.
        let syn_ack = TcpSkeleton {
            src: captured.src,
            dst: captured.dst,
            seq: captured.seq,
            ack: buddy_seq.wrapping_add(1),
            syn: true,
            ack_flag: true,
            window: captured.window,
        };
        if let Err(err) = self.io.inject(&syn_ack, &[], TTL_OK as u8) {
            return self.fail_goodbye(err.into()).await;
        }
        debug!("forged SYN/ACK toward buddy");

        let success = match self.direct.status().wait(DIRECT_CONN_TIMEOUT).await {
            Ok(success) => success,
            Err(_) => false,
        };

        write_message(&mut self.stream, &Message::Goodbye { success }).await?;
        debug!(success, "sent GOODBYE");

        if success {
            info!(%buddy, "direct connection established");
            self.direct.into_stream().await
        } else {
            Err(PeerError::DirectConnFailed)
        }
    }

    /// Report the attempt as failed to the helper, then surface `err`.
    async fn fail_goodbye(
        mut self,
        err: PeerError,
    ) -> Result<std::net::TcpStream, PeerError> {
        // Stop any capture still looping; nothing will match anymore.
        self.direct.capture_stop().cancel();
        let _ = write_message(&mut self.stream, &Message::Goodbye { success: false }).await;
        Err(err)
    }
}

/// Run a capture on a blocking thread, reporting its result on a channel.
fn spawn_sniffer(
    io: Arc<dyn PacketIo>,
    filter: TcpFilter,
    stop: CancellationToken,
) -> (
    JoinHandle<()>,
    flume::Receiver<Result<CapturedTcp, RawError>>,
) {
    let (tx, rx) = flume::bounded(1);
    let handle = tokio::task::spawn_blocking(move || {
        let result = io.wait_for_tcp(&filter, &stop);
        let _ = tx.send(result);
    });
    (handle, rx)
}
