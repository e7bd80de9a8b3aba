//! Discovery engine: broadcast advertisement and connection admission.
//!
//! Every process periodically broadcasts its handshake. A process that hears
//! a valid handshake from an unknown address dials that address, attaching
//! its own handshake to the connection request; the receiving side applies
//! the same admission rules before accepting. Either side's broadcast can
//! therefore trigger the connection.

use piconet_wire::{
    decode, encode_handshake, ConnectionRequest, Envelope, LocalAddressSet, Transport, WireError,
};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Why a broadcast or connection request was not admitted.
#[derive(Error, Debug)]
pub enum AdmissionRejected {
    #[error("address belongs to this host")]
    LocalAddress,
    #[error("peer is already connected")]
    AlreadyConnected,
    #[error("invalid handshake: {0}")]
    Handshake(#[from] WireError),
}

/// Where an address stands from discovery's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Unknown,
    Pending,
    Connected,
}

struct BroadcastTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Advertises this node and decides which peers may connect.
///
/// Tracks addresses with a connection attempt in flight so one peer is never
/// dialed twice; open connections are the transport's to report.
pub struct DiscoveryEngine {
    application_id: String,
    port: u16,
    interval: Duration,
    handshake: Vec<u8>,
    transport: Arc<dyn Transport>,
    local_addresses: LocalAddressSet,
    pending: Mutex<HashSet<IpAddr>>,
    broadcast: Mutex<Option<BroadcastTask>>,
}

impl DiscoveryEngine {
    /// Create an inactive engine advertising `application_id` on `port`.
    pub fn new(
        application_id: impl Into<String>,
        port: u16,
        interval: Duration,
        transport: Arc<dyn Transport>,
        local_addresses: LocalAddressSet,
    ) -> Self {
        let application_id = application_id.into();
        let handshake = encode_handshake(&application_id);
        Self {
            application_id,
            port,
            interval,
            handshake,
            transport,
            local_addresses,
            pending: Mutex::new(HashSet::new()),
            broadcast: Mutex::new(None),
        }
    }

    /// Start the periodic broadcast. No-op while already active.
    ///
    /// The first handshake goes out immediately, then one per interval.
    /// Must be called from within a tokio runtime.
    pub fn start_discovery(&self) {
        let mut broadcast = self.broadcast.lock().unwrap_or_else(|e| e.into_inner());
        if broadcast.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            debug!("Discovery already active");
            return;
        }

        let (cancel, cancelled) = watch::channel(false);
        let handle = tokio::spawn(broadcast_loop(
            Arc::clone(&self.transport),
            self.handshake.clone(),
            self.port,
            self.interval,
            cancelled,
        ));
        *broadcast = Some(BroadcastTask { cancel, handle });
        info!(
            port = self.port,
            interval_ms = self.interval.as_millis() as u64,
            "Discovery started"
        );
    }

    /// Stop the periodic broadcast. No broadcast is sent after this returns.
    pub fn stop_discovery(&self) {
        let task = self
            .broadcast
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.cancel.send(true);
            task.handle.abort();
            info!("Discovery stopped");
        }
    }

    /// Whether the broadcast loop is running.
    pub fn is_active(&self) -> bool {
        let broadcast = self.broadcast.lock().unwrap_or_else(|e| e.into_inner());
        broadcast.as_ref().is_some_and(|t| !t.handle.is_finished())
    }

    /// Handle a handshake broadcast heard on the network.
    ///
    /// On admission the sender becomes pending and we dial it, carrying our
    /// own handshake as the request payload.
    pub fn on_broadcast_received(
        &self,
        from: SocketAddr,
        payload: &[u8],
    ) -> Result<(), AdmissionRejected> {
        if let Err(reason) = self.admit(from.ip(), payload) {
            debug!(%from, %reason, "Broadcast ignored");
            return Err(reason);
        }

        let newly_pending = self.lock_pending().insert(from.ip());
        if newly_pending {
            debug!(%from, "Discovered peer, requesting connection");
        }
        self.transport.connect(from, self.handshake.clone());
        Ok(())
    }

    /// Answer an inbound connection request.
    ///
    /// Requests that fail admission are refused explicitly.
    pub fn on_connection_requested(
        &self,
        request: ConnectionRequest,
    ) -> Result<(), AdmissionRejected> {
        let remote = request.remote_addr();
        match self.admit(remote.ip(), request.payload()) {
            Ok(()) => {
                self.lock_pending().remove(&remote.ip());
                request.accept();
                debug!(%remote, "Connection request accepted");
                Ok(())
            }
            Err(reason) => {
                request.reject();
                debug!(%remote, %reason, "Connection request refused");
                Err(reason)
            }
        }
    }

    /// A connection to `ip` completed.
    pub fn on_peer_connected(&self, ip: IpAddr) {
        self.lock_pending().remove(&ip.to_canonical());
    }

    /// A connection to `ip` ended or an attempt failed. The address becomes
    /// discoverable again.
    pub fn on_peer_disconnected(&self, ip: IpAddr) {
        self.lock_pending().remove(&ip.to_canonical());
    }

    pub fn peer_state(&self, ip: IpAddr) -> DiscoveryState {
        let ip = ip.to_canonical();
        if self.transport.is_connected(ip) {
            DiscoveryState::Connected
        } else if self.lock_pending().contains(&ip) {
            DiscoveryState::Pending
        } else {
            DiscoveryState::Unknown
        }
    }

    /// Addresses with a connection attempt outstanding, sorted.
    pub fn pending_peers(&self) -> Vec<IpAddr> {
        let mut list: Vec<IpAddr> = self.lock_pending().iter().copied().collect();
        list.sort();
        list
    }

    pub fn clear_pending(&self) {
        self.lock_pending().clear();
    }

    /// Admission rules shared by the broadcast and connection-request paths.
    fn admit(&self, ip: IpAddr, payload: &[u8]) -> Result<(), AdmissionRejected> {
        if self.local_addresses.contains(ip) {
            return Err(AdmissionRejected::LocalAddress);
        }
        if self.transport.is_connected(ip) {
            return Err(AdmissionRejected::AlreadyConnected);
        }
        let envelope = decode(payload)
            .map_err(WireError::from)?
            .verify_identity(&self.application_id)?;
        match envelope {
            Envelope::Handshake { .. } => Ok(()),
            Envelope::Event { .. } => Err(WireError::UnexpectedEnvelope("event").into()),
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashSet<IpAddr>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        self.stop_discovery();
    }
}

async fn broadcast_loop(
    transport: Arc<dyn Transport>,
    handshake: Vec<u8>,
    port: u16,
    interval: Duration,
    mut cancelled: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancelled.changed() => break,
        }
        if *cancelled.borrow() {
            break;
        }
        if let Err(e) = transport.send_broadcast(&handshake, port).await {
            debug!(error = %e, "Discovery broadcast failed");
        }
    }
}
