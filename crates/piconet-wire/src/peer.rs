//! Handles to connected peers.
//!
//! A [`PeerRef`] is a cheap, clonable reference to one open connection. The
//! transport that created it owns the connection; holders can only queue
//! outbound data or ask for the connection to be closed.

use crate::error::WireError;
use crate::frame::check_data_size;
use chrono::{DateTime, Utc};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Work queued for a connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Deliver an encoded envelope reliably to the remote side.
    Data(Vec<u8>),
    /// Close the connection.
    Close,
}

struct PeerInner {
    id: u64,
    address: SocketAddr,
    connected_at: DateTime<Utc>,
    closed_locally: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// Non-owning reference to a connected peer.
#[derive(Clone)]
pub struct PeerRef {
    inner: Arc<PeerInner>,
}

impl PeerRef {
    /// Create a peer handle and the receiving end its transport drains.
    ///
    /// Transports call this once per established connection.
    pub fn channel(address: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Self {
            inner: Arc::new(PeerInner {
                id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
                address: canonical(address),
                connected_at: Utc::now(),
                closed_locally: AtomicBool::new(false),
                outbound: tx,
            }),
        };
        (peer, rx)
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Remote socket address.
    pub fn address(&self) -> SocketAddr {
        self.inner.address
    }

    /// Remote IP address (what discovery keys peers by).
    pub fn ip(&self) -> IpAddr {
        self.inner.address.ip()
    }

    /// When the connection was established.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    /// Queue an encoded envelope for reliable delivery.
    ///
    /// Envelopes too large for one frame are refused with
    /// [`WireError::MessageTooLarge`] and the connection stays open.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), WireError> {
        check_data_size(payload.len())?;
        self.inner
            .outbound
            .send(Outbound::Data(payload))
            .map_err(|_| WireError::ConnectionClosed)
    }

    /// Ask the transport to close this connection.
    pub fn disconnect(&self) {
        self.inner.closed_locally.store(true, Ordering::Release);
        let _ = self.inner.outbound.send(Outbound::Close);
    }

    /// Whether this side asked for the connection to close.
    pub fn closed_locally(&self) -> bool {
        self.inner.closed_locally.load(Ordering::Acquire)
    }

    /// Whether the connection's writer is still alive.
    pub fn is_open(&self) -> bool {
        !self.inner.outbound.is_closed()
    }
}

impl PartialEq for PeerRef {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for PeerRef {}

impl Hash for PeerRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRef")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("connected_at", &self.inner.connected_at)
            .finish()
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{} ({})", self.inner.id, self.inner.address)
    }
}

/// Normalise IPv4-mapped IPv6 addresses to plain IPv4.
pub fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}
