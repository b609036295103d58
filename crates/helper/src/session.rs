//! The per-session state machine.
//!
//! States are visited strictly in order: HELLO, CONN2, BUDDY_ALLOC,
//! BUDDY_PORT, an optional birthday sub-protocol, DIRECT_CONN, GOODBYE. An
//! unexpected message, a failed read or send, or an expired wait is fatal to
//! the session. Cross-session data flows one way only: this worker writes
//! its own record's fields and reads the buddy's fields after the matching
//! flag is observed set.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use punch_proto::{
    frame::{read_message, write_message},
    port_add, Endpoint, FrameError, Message, MessageKind, PortAlloc, PORT_UNKNOWN,
};
use punch_registry::{Registry, Session, SessionRef};

use std::sync::Arc;

use crate::config::Timeouts;
use crate::error::SessionError;

/// One accepted peer connection and its registry record.
pub struct SessionWorker<S> {
    stream: S,
    me: SessionRef,
    registry: Arc<Registry>,
    timeouts: Timeouts,
}

impl<S> SessionWorker<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Register a new session for a connection observed at `observed`.
    ///
    /// The record is in the registry from this point on, so a concurrent
    /// worker can already find it by observed endpoint (that is how the
    /// second-connection probe works).
    pub fn new(
        stream: S,
        observed: Endpoint,
        registry: &Arc<Registry>,
        timeouts: Timeouts,
    ) -> Self {
        let me = registry.insert(Session::new(observed));
        Self {
            stream,
            me,
            registry: registry.clone(),
            timeouts,
        }
    }

    /// Drive the session to completion.
    ///
    /// Consumes the worker; the peer socket closes and the session's registry
    /// reference is released when this returns, however it returns.
    pub async fn run(mut self) -> Result<(), SessionError> {
        self.hello().await?;
        self.classify().await?;

        let buddy = self.pair().await?;
        self.buddy_port(&buddy).await?;

        let my_alloc = self.me.alloc.get().expect("classified above");
        let buddy_alloc = buddy.alloc.get().expect("waited on in pair");

        if my_alloc.is_random() {
            self.peer_bday(&buddy).await?;
        } else if buddy_alloc.is_random() {
            self.buddy_bday(&buddy).await?;
        }

        self.direct_conn(&buddy).await?;
        self.goodbye().await
    }

    /// HELLO: learn who this peer is and which buddy it wants.
    async fn hello(&mut self) -> Result<(), SessionError> {
        let msg = match read_message(&mut self.stream, MessageKind::Hello).await {
            Ok(msg) => msg,
            // The port-prediction second connection is closed by the peer
            // without ever sending a message.
            Err(FrameError::Io(err)) => return Err(SessionError::NoHello(err)),
            Err(err) => return Err(err.into()),
        };
        let Message::Hello { peer, buddy } = msg else {
            unreachable!("read_message returns the expected kind");
        };

        debug!(peer = %peer, buddy = %buddy, "received HELLO");
        self.me.peer.set(peer);
        self.me.buddy.set(buddy);

        write_message(&mut self.stream, &Message::ConnectAgain).await?;
        debug!("sent CONNECT_AGAIN");

        Ok(())
    }

    /// CONN2: classify this peer's NAT from its second connection.
    async fn classify(&mut self) -> Result<(), SessionError> {
        read_message(&mut self.stream, MessageKind::ConnectedAgain).await?;
        debug!("received CONNECTED_AGAIN");

        let observed = self.me.observed();
        let adjacent = Endpoint::new(observed.ip, port_add(observed.port, 1));

        let alloc = match self
            .registry
            .find_timeout(|s| s.observed() == adjacent, self.timeouts.second_conn)
            .await
        {
            Ok(second) => {
                // The probe session's own worker keeps its reference; ours
                // is released right away.
                drop(second);
                self.me.alloc.set(PortAlloc::Sequential);
                // One port is reserved for the raw SYN the peer will send
                // toward its buddy, hence plus two.
                self.me.ext_port.set(port_add(observed.port, 2));
                PortAlloc::Sequential
            }
            Err(_) => {
                self.me.alloc.set(PortAlloc::Random);
                // Published as unknown so the buddy's wait completes and
                // carries it into the birthday sub-protocol.
                self.me.ext_port.set(PORT_UNKNOWN);
                PortAlloc::Random
            }
        };

        info!(%observed, %alloc, "port allocation classified");
        write_message(&mut self.stream, &Message::PortPred { alloc }).await?;
        debug!("sent PORT_PRED");

        Ok(())
    }

    /// BUDDY_ALLOC: find the buddy session and report its class.
    async fn pair(&mut self) -> Result<SessionRef, SessionError> {
        read_message(&mut self.stream, MessageKind::WaitingForBuddyAlloc).await?;
        debug!("received WAITING_FOR_BUDDY_ALLOC");

        let wanted = self.me.buddy.get().expect("recorded in hello");
        let buddy = self
            .registry
            .find_timeout(|s| s.matches_buddy(&wanted), self.timeouts.buddy)
            .await?;
        debug!(buddy = %buddy.observed(), "found buddy session");

        let buddy_alloc = buddy.alloc.wait(self.timeouts.buddy).await?;
        let my_alloc = self.me.alloc.get().expect("classified before pairing");
        let supported = !(buddy_alloc.is_random() && my_alloc.is_random());

        write_message(
            &mut self.stream,
            &Message::BuddyAlloc {
                alloc: buddy_alloc,
                supported,
            },
        )
        .await?;
        debug!(%buddy_alloc, supported, "sent BUDDY_ALLOC");

        if !supported {
            return Err(SessionError::Unsupported);
        }

        Ok(buddy)
    }

    /// BUDDY_PORT: relay the buddy's (predicted) external port.
    async fn buddy_port(&mut self, buddy: &SessionRef) -> Result<(), SessionError> {
        read_message(&mut self.stream, MessageKind::WaitingForBuddyPort).await?;
        debug!("received WAITING_FOR_BUDDY_PORT");

        let ext_port = buddy.ext_port.wait(self.timeouts.buddy).await?;

        let my_alloc = self.me.alloc.get().expect("classified before pairing");
        let buddy_alloc = buddy.alloc.get().expect("waited on in pair");
        let bday_needed = my_alloc.is_random() || buddy_alloc.is_random();

        write_message(
            &mut self.stream,
            &Message::BuddyPort {
                ext_port,
                bday_needed,
            },
        )
        .await?;
        debug!(ext_port, bday_needed, "sent BUDDY_PORT");

        Ok(())
    }

    /// START_PEER_BDAY / END_PEER_BDAY: this peer is the random one; it has
    /// flooded SYNs and now waits for the buddy's SYN/ACK flood to reveal
    /// its own external port.
    async fn peer_bday(&mut self, buddy: &SessionRef) -> Result<(), SessionError> {
        let msg = read_message(&mut self.stream, MessageKind::SynFlooded).await?;
        let Message::SynFlooded { seq } = msg else {
            unreachable!("read_message returns the expected kind");
        };
        debug!(seq, "received SYN_FLOODED");
        self.me.bday_seq.set(seq);

        write_message(&mut self.stream, &Message::BuddySynAckFlooded).await?;
        debug!("sent BUDDY_SYN_ACK_FLOODED");

        let msg = read_message(&mut self.stream, MessageKind::BdaySuccessPort).await?;
        let Message::BdaySuccessPort { port } = msg else {
            unreachable!("read_message returns the expected kind");
        };
        info!(port, "birthday flood found an open port");
        self.me.bday_port.set(port);

        // Back to the BUDDY_PORT exchange, this time with nothing left to
        // discover. The buddy's port was already waited on above.
        let ext_port = buddy.ext_port.get().expect("waited on in buddy_port");
        write_message(
            &mut self.stream,
            &Message::BuddyPort {
                ext_port,
                bday_needed: false,
            },
        )
        .await?;
        debug!(ext_port, "sent BUDDY_PORT again");

        Ok(())
    }

    /// START_BUDDY_BDAY / END_BUDDY_BDAY: the buddy is the random one; this
    /// peer floods SYN/ACKs at it and then learns the discovered port.
    async fn buddy_bday(&mut self, buddy: &SessionRef) -> Result<(), SessionError> {
        read_message(&mut self.stream, MessageKind::WaitingToSynAckFlood).await?;
        debug!("received WAITING_TO_SYN_ACK_FLOOD");

        let seq = buddy.bday_seq.wait(self.timeouts.buddy).await?;
        write_message(&mut self.stream, &Message::SynAckFloodSeqNum { seq }).await?;
        debug!(seq, "sent SYN_ACK_FLOOD_SEQ_NUM");

        read_message(&mut self.stream, MessageKind::SynAckFloodDone).await?;
        debug!("received SYN_ACK_FLOOD_DONE");

        let ext_port = buddy.bday_port.wait(self.timeouts.buddy).await?;
        write_message(
            &mut self.stream,
            &Message::BuddyPort {
                ext_port,
                bday_needed: false,
            },
        )
        .await?;
        debug!(ext_port, "sent BUDDY_PORT again");

        Ok(())
    }

    /// DIRECT_CONN: swap the captured SYN sequence numbers.
    async fn direct_conn(&mut self, buddy: &SessionRef) -> Result<(), SessionError> {
        let msg = read_message(&mut self.stream, MessageKind::BuddySynSeq).await?;
        let Message::BuddySynSeq { seq } = msg else {
            unreachable!("read_message returns the expected kind");
        };
        debug!(seq, "received BUDDY_SYN_SEQ");
        self.me.syn_seq.set(seq);

        let buddy_seq = buddy.syn_seq.wait(self.timeouts.buddy).await?;
        write_message(&mut self.stream, &Message::PeerSynSeq { seq: buddy_seq }).await?;
        debug!(seq = buddy_seq, "sent PEER_SYN_SEQ");

        Ok(())
    }

    /// GOODBYE: the peer reports how the attempt went.
    async fn goodbye(&mut self) -> Result<(), SessionError> {
        let msg = read_message(&mut self.stream, MessageKind::Goodbye).await?;
        let Message::Goodbye { success } = msg else {
            unreachable!("read_message returns the expected kind");
        };

        if success {
            info!(observed = %self.me.observed(), "peer reports direct connection established");
        } else {
            info!(observed = %self.me.observed(), "peer reports direct connection failed");
        }

        Ok(())
    }
}
