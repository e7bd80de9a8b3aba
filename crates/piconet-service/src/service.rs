//! PicoNetService: composes discovery and the session bus over one transport.
//!
//! The transport pushes everything it observes onto a queue. A pump task
//! drains that queue every `pump_interval_ms` and routes each event, in
//! arrival order, to the discovery engine and the bus. Subscriber callbacks
//! and observers therefore only ever run from the pump (or from
//! [`PicoNetService::poll_events`]), never from transport tasks.

use crate::bus::{Handler, SessionBus};
use crate::config::ServiceConfig;
use crate::discovery::DiscoveryEngine;
use crate::error::{ServiceError, ServiceResult};
use piconet_wire::{
    EventReceiver, LocalAddressSet, PeerRef, TcpTransport, Transport, TransportEvent,
};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Most events routed per pump tick.
pub const MAX_EVENTS_PER_TICK: usize = 1024;

/// Notifications fired from the pump's execution context.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Started,
    Stopped,
    PeerConnected(PeerRef),
    PeerDisconnected(PeerRef),
    /// The number of connected peers changed to this value.
    ConnectedPeersChanged(usize),
}

/// An observer of [`ServiceEvent`]s.
pub type Observer = Arc<dyn Fn(&ServiceEvent) + Send + Sync>;

struct Pump {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    pump: Option<Pump>,
    local_addr: Option<SocketAddr>,
}

struct ServiceInner {
    config: ServiceConfig,
    transport: Arc<dyn Transport>,
    discovery: DiscoveryEngine,
    bus: SessionBus,
    observers: RwLock<Vec<Observer>>,
    queue: Mutex<Option<EventReceiver>>,
    routing: Mutex<()>,
    running: AtomicBool,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

/// A PicoNet node: LAN discovery plus a named-event bus.
pub struct PicoNetService {
    inner: Arc<ServiceInner>,
}

impl PicoNetService {
    /// Build a stopped service on the TCP/UDP transport.
    pub fn new(config: ServiceConfig) -> ServiceResult<Self> {
        let transport = Arc::new(TcpTransport::new(config.ipv6_enabled));
        let local_addresses = LocalAddressSet::detect(config.ipv6_enabled);
        Self::with_transport(config, transport, local_addresses)
    }

    /// Build a stopped service on an explicit transport.
    pub fn with_transport(
        config: ServiceConfig,
        transport: Arc<dyn Transport>,
        local_addresses: LocalAddressSet,
    ) -> ServiceResult<Self> {
        config.validate()?;

        let discovery = DiscoveryEngine::new(
            config.application_id.clone(),
            config.network_port,
            config.broadcast_interval(),
            Arc::clone(&transport),
            local_addresses,
        );
        let bus = SessionBus::new(config.application_id.clone());

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                transport,
                discovery,
                bus,
                observers: RwLock::new(Vec::new()),
                queue: Mutex::new(None),
                routing: Mutex::new(()),
                running: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            }),
        })
    }

    /// Build the service and start it if `auto_start` is set.
    pub async fn init(config: ServiceConfig) -> ServiceResult<Self> {
        let auto_start = config.auto_start;
        let service = Self::new(config)?;
        if auto_start {
            service.start_service().await?;
        }
        Ok(service)
    }

    /// Open the endpoint, start the pump and begin discovery.
    ///
    /// No-op while running.
    pub async fn start_service(&self) -> ServiceResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.pump.is_some() {
            debug!("Service already running");
            return Ok(());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let local_addr = self
            .inner
            .transport
            .start(self.inner.config.network_port, events_tx)
            .await?;
        *self.inner.lock_queue() = Some(events_rx);
        self.inner.running.store(true, Ordering::SeqCst);

        let (stop, stopped) = watch::channel(false);
        let handle = tokio::spawn(pump_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.pump_interval(),
            stopped,
        ));
        lifecycle.pump = Some(Pump { stop, handle });
        lifecycle.local_addr = Some(local_addr);

        self.inner.discovery.start_discovery();
        info!(
            %local_addr,
            app_id = %self.inner.config.application_id,
            "PicoNet service started"
        );
        self.inner.notify(&ServiceEvent::Started);
        Ok(())
    }

    /// Stop discovery and the pump, then close the endpoint.
    ///
    /// No-op while stopped.
    pub async fn stop_service(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let Some(pump) = lifecycle.pump.take() else {
            return;
        };
        lifecycle.local_addr = None;

        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.discovery.stop_discovery();
        let _ = pump.stop.send(true);
        pump.handle.abort();
        self.inner.lock_queue().take();

        self.inner.transport.stop().await;
        self.inner.discovery.clear_pending();
        let dropped = self.inner.bus.clear_peers();

        info!("PicoNet service stopped");
        if dropped > 0 {
            self.inner
                .notify(&ServiceEvent::ConnectedPeersChanged(0));
        }
        self.inner.notify(&ServiceEvent::Stopped);
    }

    /// Stop the service and release subscribers and observers.
    pub async fn shutdown(self) {
        self.stop_service().await;
        self.inner.bus.clear_subscribers();
        self.inner
            .observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Bound endpoint address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lifecycle.lock().await.local_addr
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn discovery(&self) -> &DiscoveryEngine {
        &self.inner.discovery
    }

    pub fn bus(&self) -> &SessionBus {
        &self.inner.bus
    }

    pub fn subscribe(&self, event_name: &str, handler: Handler) {
        self.inner.bus.subscribe(event_name, handler);
    }

    pub fn unsubscribe(&self, event_name: &str, handler: &Handler) -> bool {
        self.inner.bus.unsubscribe(event_name, handler)
    }

    /// Send an event to every connected peer. Returns the number of peers.
    pub fn send_to_all(&self, event_name: &str, payload: &str) -> ServiceResult<usize> {
        if !self.is_running() {
            return Err(ServiceError::NotRunning);
        }
        self.inner.bus.send_to_all(event_name, payload)
    }

    pub fn send_to_peer(&self, peer: &PeerRef, event_name: &str, payload: &str) -> ServiceResult<()> {
        if !self.is_running() {
            return Err(ServiceError::NotRunning);
        }
        self.inner.bus.send_to_peer(peer, event_name, payload)
    }

    /// Peers the bus can currently address, in connection order.
    pub fn connected_peers(&self) -> Vec<PeerRef> {
        self.inner.bus.connected_peers()
    }

    pub fn connected_peer_count(&self) -> usize {
        self.inner.bus.peer_count()
    }

    /// Register an observer for lifecycle and peer notifications.
    pub fn observe(&self, observer: Observer) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Route one batch of queued transport events on the caller's context.
    ///
    /// Batches never overlap: while the pump (or another caller) is routing,
    /// this returns 0 and leaves the queue to that batch's successors.
    /// Returns the number of events taken from the queue.
    pub fn poll_events(&self) -> usize {
        self.inner.process_batch()
    }
}

impl Drop for PicoNetService {
    fn drop(&mut self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.discovery.stop_discovery();
        if let Ok(mut lifecycle) = self.inner.lifecycle.try_lock() {
            if let Some(pump) = lifecycle.pump.take() {
                let _ = pump.stop.send(true);
                pump.handle.abort();
            }
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let transport = Arc::clone(&self.inner.transport);
            runtime.spawn(async move { transport.stop().await });
        }
    }
}

impl ServiceInner {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Option<EventReceiver>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn process_batch(&self) -> usize {
        // Held for the whole batch so events are routed in arrival order.
        let _routing = match self.routing.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return 0,
        };
        let batch: Vec<TransportEvent> = {
            let mut queue = self.lock_queue();
            let Some(rx) = queue.as_mut() else {
                return 0;
            };
            let mut batch = Vec::new();
            while batch.len() < MAX_EVENTS_PER_TICK {
                match rx.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(_) => break,
                }
            }
            batch
        };

        let taken = batch.len();
        for event in batch {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.route(event);
        }
        taken
    }

    fn route(&self, event: TransportEvent) {
        match event {
            TransportEvent::UnconnectedReceived { from, payload } => {
                let _ = self.discovery.on_broadcast_received(from, &payload);
            }
            TransportEvent::ConnectionRequested(request) => {
                let _ = self.discovery.on_connection_requested(request);
            }
            TransportEvent::PeerConnected(peer) => {
                self.discovery.on_peer_connected(peer.ip());
                if let Some(count) = self.bus.add_peer(peer.clone()) {
                    info!(%peer, count, "Peer connected");
                    self.notify(&ServiceEvent::PeerConnected(peer));
                    self.notify(&ServiceEvent::ConnectedPeersChanged(count));
                }
            }
            TransportEvent::PeerDisconnected { peer, reason } => {
                self.discovery.on_peer_disconnected(peer.ip());
                if let Some(count) = self.bus.remove_peer(&peer) {
                    info!(%peer, %reason, count, "Peer disconnected");
                    self.notify(&ServiceEvent::PeerDisconnected(peer));
                    self.notify(&ServiceEvent::ConnectedPeersChanged(count));
                }
            }
            TransportEvent::ConnectFailed { addr, reason } => {
                debug!(%addr, %reason, "Connection attempt failed");
                self.discovery.on_peer_disconnected(addr.ip());
            }
            TransportEvent::Received { peer, payload } => {
                self.bus.on_message_received(&peer, &payload);
            }
        }
    }

    fn notify(&self, event: &ServiceEvent) {
        let observers: Vec<Observer> = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in &observers {
            if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
                warn!(?event, "Service observer panicked");
            }
        }
    }
}

async fn pump_loop(inner: Weak<ServiceInner>, interval: Duration, mut stopped: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stopped.changed() => break,
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.process_batch();
    }
    debug!("Pump stopped");
}
