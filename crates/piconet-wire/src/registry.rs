//! Peer registry: the transport's authoritative set of open connections.
//!
//! The [`PeerRegistry`] is a thread-safe, clonable structure shared between a
//! transport's tasks. Besides open connections it remembers which addresses
//! have an outbound attempt in flight, so repeated discovery broadcasts do not
//! stack connection attempts and simultaneous opens resolve to one link.

use crate::peer::PeerRef;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

/// Thread-safe registry of open peer connections.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<u64, PeerRef>>>,
    connecting: Arc<RwLock<HashSet<IpAddr>>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an established connection.
    pub fn add_peer(&self, peer: PeerRef) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.insert(peer.id(), peer);
    }

    /// Forget a connection. Returns it if it was registered.
    pub fn remove_peer(&self, id: u64) -> Option<PeerRef> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(&id)
    }

    /// Whether any open connection goes to `ip`.
    pub fn is_connected(&self, ip: IpAddr) -> bool {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().any(|p| p.ip() == ip)
    }

    /// Remove and return every connection.
    pub fn drain(&self) -> Vec<PeerRef> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<PeerRef> = peers.drain().map(|(_, p)| p).collect();
        list.sort_by_key(PeerRef::id);
        self.connecting
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        list
    }

    /// Claim an outbound attempt to `ip`.
    ///
    /// Returns false if `ip` is already connected or an attempt is in flight.
    pub fn begin_connecting(&self, ip: IpAddr) -> bool {
        if self.is_connected(ip) {
            return false;
        }
        let mut connecting = self.connecting.write().unwrap_or_else(|e| e.into_inner());
        connecting.insert(ip)
    }

    /// Release an outbound attempt claimed with [`begin_connecting`](Self::begin_connecting).
    pub fn finish_connecting(&self, ip: IpAddr) {
        let mut connecting = self.connecting.write().unwrap_or_else(|e| e.into_inner());
        connecting.remove(&ip);
    }

    /// Whether an outbound attempt to `ip` is in flight.
    pub fn is_connecting(&self, ip: IpAddr) -> bool {
        let connecting = self.connecting.read().unwrap_or_else(|e| e.into_inner());
        connecting.contains(&ip)
    }

    /// Simultaneous-open tie break for an inbound request from `remote`.
    ///
    /// When both sides are dialing each other, the side with the lower IP keeps
    /// its own outbound attempt and refuses the inbound one. Both ends compute
    /// the same answer, so exactly one connection survives.
    pub fn should_refuse_inbound(&self, local: IpAddr, remote: IpAddr) -> bool {
        self.is_connecting(remote) && local < remote
    }
}
