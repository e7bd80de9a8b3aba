//! Session bus: named-event pub/sub across connected peers.

use crate::error::{ServiceError, ServiceResult};
use dashmap::DashMap;
use piconet_wire::frame::check_data_size;
use piconet_wire::{decode, encode_event, Envelope, PeerRef};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// A subscriber callback. Receives the event payload.
pub type Handler = Arc<dyn Fn(&str) + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&str) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Routes named events between this process and its connected peers.
pub struct SessionBus {
    application_id: String,
    /// Event name -> subscribers in registration order.
    subscribers: DashMap<String, Vec<Handler>>,
    /// Connected peers in connection order.
    peers: RwLock<Vec<PeerRef>>,
}

impl SessionBus {
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            subscribers: DashMap::new(),
            peers: RwLock::new(Vec::new()),
        }
    }

    /// Append `handler` to the subscribers of `event_name`.
    ///
    /// The same handler may be registered more than once; each registration
    /// is invoked.
    pub fn subscribe(&self, event_name: &str, handler: Handler) {
        self.subscribers
            .entry(event_name.to_string())
            .or_default()
            .push(handler);
    }

    /// Remove the first registration of `handler` for `event_name`.
    ///
    /// Returns whether anything was removed.
    pub fn unsubscribe(&self, event_name: &str, handler: &Handler) -> bool {
        let Some(mut list) = self.subscribers.get_mut(event_name) else {
            return false;
        };
        match list.iter().position(|h| Arc::ptr_eq(h, handler)) {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of registrations for `event_name`.
    pub fn subscriber_count(&self, event_name: &str) -> usize {
        self.subscribers
            .get(event_name)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    pub fn clear_subscribers(&self) {
        self.subscribers.clear();
    }

    /// Queue an event to every connected peer. Returns how many peers it was
    /// queued to.
    ///
    /// An event too large for one frame is refused before reaching any peer.
    pub fn send_to_all(&self, event_name: &str, payload: &str) -> ServiceResult<usize> {
        validate_event_name(event_name)?;
        let bytes = encode_event(&self.application_id, event_name, payload);
        check_data_size(bytes.len())?;

        let mut sent = 0;
        for peer in self.connected_peers() {
            match peer.send(bytes.clone()) {
                Ok(()) => sent += 1,
                Err(e) => debug!(%peer, error = %e, "Dropping event for closing peer"),
            }
        }
        debug!(event = event_name, peers = sent, "Event sent to all peers");
        Ok(sent)
    }

    /// Queue an event to one connected peer.
    pub fn send_to_peer(&self, peer: &PeerRef, event_name: &str, payload: &str) -> ServiceResult<()> {
        validate_event_name(event_name)?;
        if !self.lock_peers_read().contains(peer) {
            return Err(ServiceError::PeerNotConnected(peer.to_string()));
        }
        let bytes = encode_event(&self.application_id, event_name, payload);
        check_data_size(bytes.len())?;
        peer.send(bytes)
            .map_err(|_| ServiceError::PeerNotConnected(peer.to_string()))
    }

    /// Decode a message from `from` and dispatch it to the event's
    /// subscribers. Returns the number of handlers invoked.
    ///
    /// Undecodable messages, foreign application ids, handshakes and blank
    /// event names are dropped.
    pub fn on_message_received(&self, from: &PeerRef, bytes: &[u8]) -> usize {
        let envelope = match decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(peer = %from, error = %e, "Dropping undecodable message");
                return 0;
            }
        };
        let envelope = match envelope.verify_identity(&self.application_id) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(peer = %from, error = %e, "Dropping message");
                return 0;
            }
        };
        let (name, payload) = match envelope {
            Envelope::Event { name, payload, .. } => (name, payload),
            Envelope::Handshake { .. } => {
                debug!(peer = %from, "Ignoring handshake on open connection");
                return 0;
            }
        };
        if name.trim().is_empty() {
            debug!(peer = %from, "Dropping event without a name");
            return 0;
        }

        // Snapshot, so handlers may subscribe/unsubscribe while we iterate.
        let snapshot: Vec<Handler> = match self.subscribers.get(&name) {
            Some(list) => list.clone(),
            None => return 0,
        };

        for handler in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(payload.as_str()))).is_err() {
                warn!(event = %name, peer = %from, "Event handler panicked");
            }
        }
        snapshot.len()
    }

    /// Track a newly connected peer. Returns the new count, or `None` if the
    /// peer was already known.
    pub fn add_peer(&self, peer: PeerRef) -> Option<usize> {
        let mut peers = self.lock_peers_write();
        if peers.contains(&peer) {
            return None;
        }
        peers.push(peer);
        Some(peers.len())
    }

    /// Forget a peer. Returns the new count, or `None` if it was unknown.
    pub fn remove_peer(&self, peer: &PeerRef) -> Option<usize> {
        let mut peers = self.lock_peers_write();
        let index = peers.iter().position(|p| p == peer)?;
        peers.remove(index);
        Some(peers.len())
    }

    /// Forget every peer. Returns how many there were.
    pub fn clear_peers(&self) -> usize {
        let mut peers = self.lock_peers_write();
        let count = peers.len();
        peers.clear();
        count
    }

    pub fn connected_peers(&self) -> Vec<PeerRef> {
        self.lock_peers_read().clone()
    }

    pub fn peer_count(&self) -> usize {
        self.lock_peers_read().len()
    }

    fn lock_peers_read(&self) -> std::sync::RwLockReadGuard<'_, Vec<PeerRef>> {
        self.peers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_peers_write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<PeerRef>> {
        self.peers.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn validate_event_name(event_name: &str) -> ServiceResult<()> {
    if event_name.trim().is_empty() {
        return Err(ServiceError::InvalidEventName(event_name.to_string()));
    }
    Ok(())
}
