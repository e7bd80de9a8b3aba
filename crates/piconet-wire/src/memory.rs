//! In-process transport.
//!
//! A [`MemoryNetwork`] is a shared switchboard keyed by socket address. Each
//! [`MemoryTransport`] created from it behaves like a host with its own IP:
//! broadcasts reach every started node on the target port (the sender
//! included, as on a real LAN), and connections go through the same
//! request/accept exchange as the TCP endpoint.

use crate::error::WireError;
use crate::peer::{canonical, Outbound, PeerRef};
use crate::registry::PeerRegistry;
use crate::transport::{
    await_decision, ConnectionRequest, DisconnectReason, EventSender, Transport, TransportEvent,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// First port handed out when a node starts on port 0.
const EPHEMERAL_BASE: u16 = 49152;

#[derive(Clone)]
struct MemoryNode {
    events: EventSender,
    registry: PeerRegistry,
}

/// Shared in-memory network. Clones refer to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<RwLock<HashMap<SocketAddr, MemoryNode>>>,
    next_port: Arc<AtomicU16>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stopped transport for a host with address `ip`.
    pub fn transport(&self, ip: IpAddr) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            ip: ip.to_canonical(),
            registry: PeerRegistry::new(),
            state: Mutex::new(None),
        }
    }

    /// Number of started nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn node(&self, addr: SocketAddr) -> Option<MemoryNode> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.get(&addr).cloned()
    }

    fn nodes_on_port(&self, port: u16) -> Vec<MemoryNode> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes
            .iter()
            .filter(|(addr, _)| addr.port() == port)
            .map(|(_, node)| node.clone())
            .collect()
    }

    fn register(&self, addr: SocketAddr, node: MemoryNode) -> Result<(), WireError> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if nodes.contains_key(&addr) {
            return Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("{addr} is already bound"),
            )));
        }
        nodes.insert(addr, node);
        Ok(())
    }

    fn unregister(&self, addr: SocketAddr) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.remove(&addr);
    }

    fn ephemeral_port(&self) -> u16 {
        EPHEMERAL_BASE.wrapping_add(self.next_port.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("nodes", &self.node_count())
            .finish()
    }
}

/// One host on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    ip: IpAddr,
    registry: PeerRegistry,
    state: Mutex<Option<(SocketAddr, EventSender)>>,
}

impl MemoryTransport {
    /// The host address this transport represents.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.as_ref().map(|(addr, _)| *addr)
    }

    fn local_node(&self) -> Option<(SocketAddr, MemoryNode)> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.as_ref().map(|(addr, events)| {
            (
                *addr,
                MemoryNode {
                    events: events.clone(),
                    registry: self.registry.clone(),
                },
            )
        })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self, port: u16, events: EventSender) -> Result<SocketAddr, WireError> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let port = if port == 0 {
            self.network.ephemeral_port()
        } else {
            port
        };
        let addr = SocketAddr::new(self.ip, port);
        self.network.register(
            addr,
            MemoryNode {
                events: events.clone(),
                registry: self.registry.clone(),
            },
        )?;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = Some((addr, events));
        debug!(%addr, "PicoNet: memory endpoint started");
        Ok(addr)
    }

    async fn stop(&self) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some((addr, _)) = state else {
            return;
        };
        self.network.unregister(addr);
        for peer in self.registry.drain() {
            peer.disconnect();
        }
        debug!(%addr, "PicoNet: memory endpoint stopped");
    }

    async fn send_broadcast(&self, payload: &[u8], port: u16) -> Result<(), WireError> {
        let from = self.local_addr().ok_or(WireError::NotStarted)?;
        for node in self.network.nodes_on_port(port) {
            let _ = node.events.send(TransportEvent::UnconnectedReceived {
                from,
                payload: payload.to_vec(),
            });
        }
        Ok(())
    }

    fn connect(&self, addr: SocketAddr, request: Vec<u8>) {
        let addr = canonical(addr);
        let Some((local_addr, local)) = self.local_node() else {
            debug!(%addr, "PicoNet: connect ignored, endpoint not started");
            return;
        };
        if !self.registry.begin_connecting(addr.ip()) {
            debug!(%addr, "PicoNet: connection already open or in flight");
            return;
        }

        let network = self.network.clone();
        tokio::spawn(async move {
            let outcome = dial(&network, local_addr, &local, addr, request).await;
            local.registry.finish_connecting(addr.ip());
            if let Err(reason) = outcome {
                debug!(%addr, %reason, "PicoNet: outbound connection failed");
                let _ = local
                    .events
                    .send(TransportEvent::ConnectFailed { addr, reason });
            }
        });
    }

    fn is_connected(&self, ip: IpAddr) -> bool {
        self.registry.is_connected(ip.to_canonical())
    }
}

async fn dial(
    network: &MemoryNetwork,
    local_addr: SocketAddr,
    local: &MemoryNode,
    remote_addr: SocketAddr,
    request: Vec<u8>,
) -> Result<(), DisconnectReason> {
    let remote = network
        .node(remote_addr)
        .ok_or(DisconnectReason::Unreachable)?;

    if remote
        .registry
        .should_refuse_inbound(remote_addr.ip(), local_addr.ip())
    {
        return Err(DisconnectReason::Rejected);
    }

    let (request, decision) = ConnectionRequest::new(local_addr, request);
    if remote
        .events
        .send(TransportEvent::ConnectionRequested(request))
        .is_err()
    {
        return Err(DisconnectReason::Unreachable);
    }
    if !await_decision(decision).await {
        return Err(DisconnectReason::Rejected);
    }
    // The remote may have started its own attempt or finished one meanwhile.
    if remote
        .registry
        .should_refuse_inbound(remote_addr.ip(), local_addr.ip())
        || remote.registry.is_connected(local_addr.ip())
    {
        return Err(DisconnectReason::Rejected);
    }

    link(local_addr, local.clone(), remote_addr, remote);
    Ok(())
}

enum Closer {
    Local,
    Remote,
}

/// Wire two nodes together and pump data between them until either closes.
fn link(local_addr: SocketAddr, local: MemoryNode, remote_addr: SocketAddr, remote: MemoryNode) {
    let (to_remote, mut local_out) = PeerRef::channel(remote_addr);
    let (to_local, mut remote_out) = PeerRef::channel(local_addr);

    remote.registry.add_peer(to_local.clone());
    local.registry.add_peer(to_remote.clone());
    let _ = remote
        .events
        .send(TransportEvent::PeerConnected(to_local.clone()));
    let _ = local
        .events
        .send(TransportEvent::PeerConnected(to_remote.clone()));
    info!(%local_addr, %remote_addr, "PicoNet: memory link established");

    tokio::spawn(async move {
        let closer = loop {
            tokio::select! {
                item = local_out.recv() => match item {
                    Some(Outbound::Data(payload)) => {
                        let _ = remote.events.send(TransportEvent::Received {
                            peer: to_local.clone(),
                            payload,
                        });
                    }
                    Some(Outbound::Close) | None => break Closer::Local,
                },
                item = remote_out.recv() => match item {
                    Some(Outbound::Data(payload)) => {
                        let _ = local.events.send(TransportEvent::Received {
                            peer: to_remote.clone(),
                            payload,
                        });
                    }
                    Some(Outbound::Close) | None => break Closer::Remote,
                },
            }
        };
        drop(local_out);
        drop(remote_out);

        let (local_reason, remote_reason) = match closer {
            Closer::Local => (DisconnectReason::LocalClose, DisconnectReason::RemoteClosed),
            Closer::Remote => (DisconnectReason::RemoteClosed, DisconnectReason::LocalClose),
        };
        // A stopped node has drained its registry and gets no further events.
        if local.registry.remove_peer(to_remote.id()).is_some() {
            let _ = local.events.send(TransportEvent::PeerDisconnected {
                peer: to_remote,
                reason: local_reason,
            });
        }
        if remote.registry.remove_peer(to_local.id()).is_some() {
            let _ = remote.events.send(TransportEvent::PeerDisconnected {
                peer: to_local,
                reason: remote_reason,
            });
        }
        debug!(%local_addr, %remote_addr, "PicoNet: memory link closed");
    });
}
