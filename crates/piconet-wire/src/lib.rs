//! PicoNet wire layer: LAN discovery handshakes and peer transports.
//!
//! Provides the envelope codec shared by discovery and the session bus, the
//! stream framing used on peer connections, and the transports the service
//! runs on.
//!
//! ## Architecture
//!
//! - **Envelope**: handshake / named-event tagged union with a strict codec
//! - **Transport**: trait for broadcast + admitted connections, reporting
//!   everything as `TransportEvent`s on a queue
//! - **TcpTransport**: UDP broadcast and TCP connections on one port
//! - **MemoryTransport**: in-process network for tests and offline meshes
//! - **PeerRegistry**: a transport's authoritative set of open connections

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod local;
pub mod memory;
pub mod peer;
pub mod registry;
pub mod transport;

pub use codec::{decode, encode_event, encode_handshake, Envelope, HANDSHAKE_MARKER};
pub use endpoint::TcpTransport;
pub use error::{DecodeError, WireError};
pub use local::LocalAddressSet;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use peer::PeerRef;
pub use registry::PeerRegistry;
pub use transport::{
    ConnectionRequest, DisconnectReason, EventReceiver, EventSender, Transport, TransportEvent,
};
