//! The transport seam.
//!
//! A [`Transport`] provides unconnected broadcast datagrams plus reliable
//! peer connections with an admission step. It never calls application code
//! directly: everything it observes is pushed as a [`TransportEvent`] into the
//! queue handed to [`Transport::start`], and the owner drains that queue on
//! its own execution context.

use crate::error::WireError;
use crate::peer::PeerRef;
use async_trait::async_trait;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// How long a transport waits for the owner to accept or reject a request.
pub const DECISION_TIMEOUT: Duration = Duration::from_secs(5);

/// Sending half of the transport event queue.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half of the transport event queue.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Why a connection ended or never came up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote side closed the connection.
    RemoteClosed,
    /// This side closed the connection.
    LocalClose,
    /// The remote side refused our connection request.
    Rejected,
    /// No answer within the transport's timeout.
    Timeout,
    /// Nothing is listening at the target address.
    Unreachable,
    /// Any other transport failure.
    Error(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteClosed => write!(f, "remote_closed"),
            Self::LocalClose => write!(f, "local_close"),
            Self::Rejected => write!(f, "rejected"),
            Self::Timeout => write!(f, "timeout"),
            Self::Unreachable => write!(f, "unreachable"),
            Self::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// Everything a transport reports to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// A datagram arrived outside any connection (discovery broadcast).
    UnconnectedReceived { from: SocketAddr, payload: Vec<u8> },
    /// A remote peer asks to connect and awaits a decision.
    ConnectionRequested(ConnectionRequest),
    /// A connection was established (either direction).
    PeerConnected(PeerRef),
    /// An established connection ended.
    PeerDisconnected {
        peer: PeerRef,
        reason: DisconnectReason,
    },
    /// An outbound connection attempt did not complete.
    ConnectFailed {
        addr: SocketAddr,
        reason: DisconnectReason,
    },
    /// Data arrived on an established connection.
    Received { peer: PeerRef, payload: Vec<u8> },
}

/// An inbound connection request that must be answered.
///
/// Dropping the request without answering refuses it, so the requester
/// always observes a definitive rejection rather than a timeout.
pub struct ConnectionRequest {
    remote: SocketAddr,
    payload: Vec<u8>,
    reply: Option<oneshot::Sender<bool>>,
}

impl ConnectionRequest {
    /// Create a request and the receiver the transport awaits the decision on.
    pub fn new(remote: SocketAddr, payload: Vec<u8>) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                remote: crate::peer::canonical(remote),
                payload,
                reply: Some(tx),
            },
            rx,
        )
    }

    /// Address of the requesting peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Payload attached to the request (the requester's handshake).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Admit the connection.
    pub fn accept(mut self) {
        self.answer(true);
    }

    /// Refuse the connection.
    pub fn reject(mut self) {
        self.answer(false);
    }

    fn answer(&mut self, accepted: bool) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(accepted);
        }
    }
}

impl Drop for ConnectionRequest {
    fn drop(&mut self) {
        self.answer(false);
    }
}

impl fmt::Debug for ConnectionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRequest")
            .field("remote", &self.remote)
            .field("payload_len", &self.payload.len())
            .field("answered", &self.reply.is_none())
            .finish()
    }
}

/// Wait (bounded) for the owner's decision on a connection request.
pub async fn await_decision(decision: oneshot::Receiver<bool>) -> bool {
    matches!(
        tokio::time::timeout(DECISION_TIMEOUT, decision).await,
        Ok(Ok(true))
    )
}

/// A LAN transport: broadcast datagrams plus admitted peer connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the endpoint on `port` and start reporting into `events`.
    ///
    /// Returns the bound local address.
    async fn start(&self, port: u16, events: EventSender) -> Result<SocketAddr, WireError>;

    /// Close every connection and the endpoint. No events follow.
    async fn stop(&self);

    /// Send `payload` as a network-wide broadcast to `port`.
    async fn send_broadcast(&self, payload: &[u8], port: u16) -> Result<(), WireError>;

    /// Request a connection to `addr` carrying `request` as attached payload.
    ///
    /// Returns immediately; the outcome arrives as `PeerConnected` or
    /// `ConnectFailed`. Addresses already connected or being connected to
    /// are skipped.
    fn connect(&self, addr: SocketAddr, request: Vec<u8>);

    /// Whether an open connection exists to `ip`.
    fn is_connected(&self, ip: IpAddr) -> bool;
}
