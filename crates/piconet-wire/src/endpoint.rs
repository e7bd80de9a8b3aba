//! TcpTransport: the LAN endpoint used in production.
//!
//! One UDP socket and one TCP listener share the configured port. Discovery
//! handshakes travel as UDP broadcasts; a peer that wants to connect dials
//! the TCP listener at the datagram's source address and sends a `Connect`
//! frame carrying its handshake. The owner admits or refuses the request via
//! [`ConnectionRequest`], after which `Data` frames flow in both directions
//! until either side closes.

use crate::error::WireError;
use crate::frame::{read_frame, write_frame, Frame};
use crate::peer::{canonical, Outbound, PeerRef};
use crate::registry::PeerRegistry;
use crate::transport::{
    await_decision, ConnectionRequest, DisconnectReason, EventSender, Transport, TransportEvent,
};

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound for dialing a peer and for each side of the admission exchange.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle time before TCP keepalive probes start on an open connection.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(5);

/// Largest datagram we read.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Link-local all-nodes group, the IPv6 stand-in for broadcast.
const IPV6_ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

const LISTEN_BACKLOG: i32 = 128;

/// Shared context handed to every task of a running endpoint.
#[derive(Clone)]
struct Link {
    registry: PeerRegistry,
    events: EventSender,
    shutdown: watch::Receiver<bool>,
}

struct EndpointState {
    local_addr: SocketAddr,
    udp: Arc<UdpSocket>,
    link: Link,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// UDP broadcast + TCP connection transport.
pub struct TcpTransport {
    ipv6: bool,
    registry: PeerRegistry,
    state: Mutex<Option<EndpointState>>,
}

impl TcpTransport {
    /// Create a stopped endpoint. `ipv6` enables dual-stack sockets.
    pub fn new(ipv6: bool) -> Self {
        Self {
            ipv6,
            registry: PeerRegistry::new(),
            state: Mutex::new(None),
        }
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.as_ref().map(|s| s.local_addr)
    }

    fn link(&self) -> Option<Link> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.as_ref().map(|s| s.link.clone())
    }

    fn udp(&self) -> Option<Arc<UdpSocket>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.as_ref().map(|s| Arc::clone(&s.udp))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&self, port: u16, events: EventSender) -> Result<SocketAddr, WireError> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listener = bind_listener(self.ipv6, port)?;
        let local_addr = listener.local_addr()?;
        // Port 0 resolves on the listener; the datagram socket follows it.
        let udp = Arc::new(bind_datagram(self.ipv6, local_addr.port())?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let link = Link {
            registry: self.registry.clone(),
            events,
            shutdown: shutdown_rx,
        };
        let tasks = vec![
            tokio::spawn(receive_loop(Arc::clone(&udp), link.clone())),
            tokio::spawn(accept_loop(listener, link.clone())),
        ];

        info!(%local_addr, ipv6 = self.ipv6, "PicoNet: endpoint listening");

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = Some(EndpointState {
            local_addr,
            udp,
            link,
            shutdown: shutdown_tx,
            tasks,
        });
        Ok(local_addr)
    }

    async fn stop(&self) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(state) = state else {
            return;
        };

        let _ = state.shutdown.send(true);
        for task in &state.tasks {
            task.abort();
        }
        for peer in self.registry.drain() {
            peer.disconnect();
        }
        info!(local_addr = %state.local_addr, "PicoNet: endpoint closed");
    }

    async fn send_broadcast(&self, payload: &[u8], port: u16) -> Result<(), WireError> {
        let udp = self.udp().ok_or(WireError::NotStarted)?;

        let mut last_error = None;
        let mut delivered = false;
        for target in broadcast_targets(self.ipv6, port) {
            match udp.send_to(payload, target).await {
                Ok(_) => delivered = true,
                Err(e) => {
                    debug!(%target, error = %e, "PicoNet: broadcast send failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !delivered => Err(WireError::Io(e)),
            _ => Ok(()),
        }
    }

    fn connect(&self, addr: SocketAddr, request: Vec<u8>) {
        let addr = canonical(addr);
        let Some(link) = self.link() else {
            debug!(%addr, "PicoNet: connect ignored, endpoint not started");
            return;
        };
        if !self.registry.begin_connecting(addr.ip()) {
            debug!(%addr, "PicoNet: connection already open or in flight");
            return;
        }

        tokio::spawn(async move {
            let outcome = dial(addr, request, &link).await;
            link.registry.finish_connecting(addr.ip());
            if let Err(reason) = outcome {
                debug!(%addr, %reason, "PicoNet: outbound connection failed");
                let _ = link
                    .events
                    .send(TransportEvent::ConnectFailed { addr, reason });
            }
        });
    }

    fn is_connected(&self, ip: IpAddr) -> bool {
        self.registry.is_connected(ip.to_canonical())
    }
}

fn unspecified(ipv6: bool, port: u16) -> (Domain, SocketAddr) {
    if ipv6 {
        (
            Domain::IPV6,
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        )
    } else {
        (
            Domain::IPV4,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        )
    }
}

fn bind_listener(ipv6: bool, port: u16) -> std::io::Result<TcpListener> {
    let (domain, addr) = unspecified(ipv6, port);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if ipv6 {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

fn bind_datagram(ipv6: bool, port: u16) -> std::io::Result<UdpSocket> {
    let (domain, addr) = unspecified(ipv6, port);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if ipv6 {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

fn broadcast_targets(ipv6: bool, port: u16) -> Vec<SocketAddr> {
    if ipv6 {
        vec![
            SocketAddr::new(IpAddr::V6(Ipv4Addr::BROADCAST.to_ipv6_mapped()), port),
            SocketAddr::new(IpAddr::V6(IPV6_ALL_NODES), port),
        ]
    } else {
        vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port)]
    }
}

fn configure_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "PicoNet: could not enable TCP keepalive");
    }
}

/// Deliver every datagram on the shared port to the owner.
async fn receive_loop(udp: Arc<UdpSocket>, link: Link) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match udp.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let _ = link.events.send(TransportEvent::UnconnectedReceived {
                    from: canonical(from),
                    payload: buf[..len].to_vec(),
                });
            }
            Err(e) => {
                debug!(error = %e, "PicoNet: datagram receive failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Accept loop, runs in a spawned task.
async fn accept_loop(listener: TcpListener, link: Link) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let addr = canonical(addr);
                debug!(%addr, "PicoNet: accepted TCP connection");
                let link = link.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_inbound(stream, addr, link).await {
                        debug!(%addr, error = %e, "PicoNet: inbound connection dropped");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "PicoNet: accept error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Run the admission exchange for one inbound connection.
async fn handle_inbound(stream: TcpStream, addr: SocketAddr, link: Link) -> Result<(), WireError> {
    configure_stream(&stream);
    let local_ip = stream.local_addr()?.ip().to_canonical();
    let (mut reader, mut writer) = stream.into_split();

    let payload = match tokio::time::timeout(CONNECT_TIMEOUT, read_frame(&mut reader)).await {
        Err(_) => return Err(WireError::Timeout("connection request")),
        Ok(Ok(Frame::Connect(payload))) => payload,
        Ok(Ok(_)) => {
            write_frame(&mut writer, &Frame::Reject).await?;
            return Err(WireError::HandshakeFailed(
                "expected a connection request".to_string(),
            ));
        }
        Ok(Err(e)) => return Err(e),
    };

    if link.registry.should_refuse_inbound(local_ip, addr.ip()) {
        debug!(%addr, "PicoNet: simultaneous open, keeping our own attempt");
        write_frame(&mut writer, &Frame::Reject).await?;
        return Ok(());
    }

    let (request, decision) = ConnectionRequest::new(addr, payload);
    // If the owner is gone the request is dropped, which counts as a refusal.
    let _ = link
        .events
        .send(TransportEvent::ConnectionRequested(request));
    if !await_decision(decision).await {
        write_frame(&mut writer, &Frame::Reject).await?;
        debug!(%addr, "PicoNet: connection request refused");
        return Ok(());
    }
    // Our own attempt may have started or completed while the owner decided.
    if link.registry.should_refuse_inbound(local_ip, addr.ip())
        || link.registry.is_connected(addr.ip())
    {
        write_frame(&mut writer, &Frame::Reject).await?;
        debug!(%addr, "PicoNet: duplicate connection refused");
        return Ok(());
    }

    write_frame(&mut writer, &Frame::Accept).await?;
    let peer = spawn_connection(reader, writer, addr, link);
    info!(%peer, "PicoNet: peer connected (inbound)");
    Ok(())
}

/// Dial `addr`, send our request and wait for the verdict.
async fn dial(addr: SocketAddr, request: Vec<u8>, link: &Link) -> Result<(), DisconnectReason> {
    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Err(_) => return Err(DisconnectReason::Timeout),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            return Err(DisconnectReason::Unreachable)
        }
        Ok(Err(e)) => return Err(DisconnectReason::Error(e.to_string())),
        Ok(Ok(stream)) => stream,
    };
    configure_stream(&stream);
    let (mut reader, mut writer) = stream.into_split();

    write_frame(&mut writer, &Frame::Connect(request))
        .await
        .map_err(|e| DisconnectReason::Error(e.to_string()))?;

    match tokio::time::timeout(CONNECT_TIMEOUT, read_frame(&mut reader)).await {
        Err(_) => Err(DisconnectReason::Timeout),
        Ok(Ok(Frame::Accept)) => {
            let peer = spawn_connection(reader, writer, addr, link.clone());
            info!(%peer, "PicoNet: peer connected (outbound)");
            Ok(())
        }
        Ok(Ok(Frame::Reject)) => Err(DisconnectReason::Rejected),
        Ok(Ok(_)) => Err(DisconnectReason::Error(
            "unexpected frame during admission".to_string(),
        )),
        Ok(Err(WireError::ConnectionClosed)) => Err(DisconnectReason::RemoteClosed),
        Ok(Err(e)) => Err(DisconnectReason::Error(e.to_string())),
    }
}

/// Register an admitted connection, announce it, and start its I/O tasks.
///
/// `PeerConnected` is queued before the reader starts so the owner never
/// sees data from a peer it has not been told about.
fn spawn_connection(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    addr: SocketAddr,
    link: Link,
) -> PeerRef {
    let (peer, mut outbox) = PeerRef::channel(addr);
    link.registry.add_peer(peer.clone());
    let _ = link.events.send(TransportEvent::PeerConnected(peer.clone()));

    tokio::spawn(async move {
        while let Some(item) = outbox.recv().await {
            match item {
                Outbound::Data(payload) => match write_frame(&mut writer, &Frame::Data(payload)).await {
                    Ok(()) => {}
                    // Refused before any byte was written; the stream is intact.
                    Err(e @ WireError::MessageTooLarge { .. }) => {
                        warn!(error = %e, "PicoNet: dropping oversized frame");
                    }
                    Err(e) => {
                        debug!(error = %e, "PicoNet: write failed");
                        break;
                    }
                },
                Outbound::Close => break,
            }
        }
        let _ = writer.shutdown().await;
    });

    let reader_peer = peer.clone();
    tokio::spawn(async move {
        let mut shutdown = link.shutdown.clone();
        let reason = loop {
            tokio::select! {
                frame = read_frame(&mut reader) => match frame {
                    Ok(Frame::Data(payload)) => {
                        let _ = link.events.send(TransportEvent::Received {
                            peer: reader_peer.clone(),
                            payload,
                        });
                    }
                    Ok(_) => {
                        debug!(peer = %reader_peer, "PicoNet: ignoring control frame on open connection");
                    }
                    Err(WireError::ConnectionClosed) => break Some(DisconnectReason::RemoteClosed),
                    Err(e) => break Some(DisconnectReason::Error(e.to_string())),
                },
                _ = shutdown.changed() => break None,
            }
        };

        let reason = reason.map(|r| {
            if reader_peer.closed_locally() {
                DisconnectReason::LocalClose
            } else {
                r
            }
        });
        reader_peer.disconnect();

        // Endpoint shutdown drains the registry itself and reports nothing.
        if link.registry.remove_peer(reader_peer.id()).is_some() {
            if let Some(reason) = reason {
                info!(peer = %reader_peer, %reason, "PicoNet: peer disconnected");
                let _ = link.events.send(TransportEvent::PeerDisconnected {
                    peer: reader_peer,
                    reason,
                });
            }
        }
    });

    peer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EventReceiver;
    use tokio::sync::mpsc;

    async fn next_event(rx: &mut EventReceiver) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event queue closed")
    }

    async fn start_endpoint() -> (TcpTransport, EventReceiver, SocketAddr) {
        let transport = TcpTransport::new(false);
        let (tx, rx) = mpsc::unbounded_channel();
        let bound = transport.start(0, tx).await.unwrap();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port());
        (transport, rx, addr)
    }

    #[tokio::test]
    async fn test_connect_accept_and_exchange() {
        let (dialer, mut dialer_rx, _) = start_endpoint().await;
        let (listener, mut listener_rx, listener_addr) = start_endpoint().await;

        dialer.connect(listener_addr, b"handshake".to_vec());

        match next_event(&mut listener_rx).await {
            TransportEvent::ConnectionRequested(req) => {
                assert_eq!(req.payload(), b"handshake");
                req.accept();
            }
            other => panic!("Expected ConnectionRequested, got {other:?}"),
        }

        let to_listener = match next_event(&mut dialer_rx).await {
            TransportEvent::PeerConnected(peer) => peer,
            other => panic!("Expected PeerConnected, got {other:?}"),
        };
        assert_eq!(to_listener.address(), listener_addr);
        let to_dialer = match next_event(&mut listener_rx).await {
            TransportEvent::PeerConnected(peer) => peer,
            other => panic!("Expected PeerConnected, got {other:?}"),
        };
        assert!(dialer.is_connected(Ipv4Addr::LOCALHOST.into()));
        assert!(listener.is_connected(Ipv4Addr::LOCALHOST.into()));

        to_listener.send(b"ping".to_vec()).unwrap();
        match next_event(&mut listener_rx).await {
            TransportEvent::Received { peer, payload } => {
                assert_eq!(peer, to_dialer);
                assert_eq!(payload, b"ping");
            }
            other => panic!("Expected Received, got {other:?}"),
        }

        to_listener.disconnect();
        match next_event(&mut listener_rx).await {
            TransportEvent::PeerDisconnected { peer, reason } => {
                assert_eq!(peer, to_dialer);
                assert_eq!(reason, DisconnectReason::RemoteClosed);
            }
            other => panic!("Expected PeerDisconnected, got {other:?}"),
        }
        match next_event(&mut dialer_rx).await {
            TransportEvent::PeerDisconnected { reason, .. } => {
                assert_eq!(reason, DisconnectReason::LocalClose);
            }
            other => panic!("Expected PeerDisconnected, got {other:?}"),
        }
        assert!(!dialer.is_connected(Ipv4Addr::LOCALHOST.into()));

        dialer.stop().await;
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_rejected_request_reports_connect_failed() {
        let (dialer, mut dialer_rx, _) = start_endpoint().await;
        let (listener, mut listener_rx, listener_addr) = start_endpoint().await;

        dialer.connect(listener_addr, b"wrong".to_vec());
        match next_event(&mut listener_rx).await {
            TransportEvent::ConnectionRequested(req) => req.reject(),
            other => panic!("Expected ConnectionRequested, got {other:?}"),
        }

        match next_event(&mut dialer_rx).await {
            TransportEvent::ConnectFailed { addr, reason } => {
                assert_eq!(addr, listener_addr);
                assert_eq!(reason, DisconnectReason::Rejected);
            }
            other => panic!("Expected ConnectFailed, got {other:?}"),
        }
        assert!(!listener.is_connected(Ipv4Addr::LOCALHOST.into()));

        dialer.stop().await;
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_oversized_payload_refused_and_link_kept() {
        let (dialer, mut dialer_rx, _) = start_endpoint().await;
        let (listener, mut listener_rx, listener_addr) = start_endpoint().await;

        dialer.connect(listener_addr, b"handshake".to_vec());
        match next_event(&mut listener_rx).await {
            TransportEvent::ConnectionRequested(req) => req.accept(),
            other => panic!("Expected ConnectionRequested, got {other:?}"),
        }
        let to_listener = match next_event(&mut dialer_rx).await {
            TransportEvent::PeerConnected(peer) => peer,
            other => panic!("Expected PeerConnected, got {other:?}"),
        };
        assert!(matches!(
            next_event(&mut listener_rx).await,
            TransportEvent::PeerConnected(_)
        ));

        let oversized = vec![b'x'; 17 * 1024 * 1024];
        assert!(matches!(
            to_listener.send(oversized),
            Err(WireError::MessageTooLarge { .. })
        ));

        // The next frame still arrives on the same connection.
        to_listener.send(b"after".to_vec()).unwrap();
        match next_event(&mut listener_rx).await {
            TransportEvent::Received { payload, .. } => assert_eq!(payload, b"after"),
            other => panic!("Expected Received, got {other:?}"),
        }
        assert!(dialer.is_connected(Ipv4Addr::LOCALHOST.into()));
        assert!(listener.is_connected(Ipv4Addr::LOCALHOST.into()));
        assert!(to_listener.is_open());

        dialer.stop().await;
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let (dialer, mut dialer_rx, _) = start_endpoint().await;
        let closed = {
            let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            scratch.local_addr().unwrap()
        };

        dialer.connect(closed, b"hs".to_vec());
        match next_event(&mut dialer_rx).await {
            TransportEvent::ConnectFailed { addr, .. } => assert_eq!(addr, closed),
            other => panic!("Expected ConnectFailed, got {other:?}"),
        }
        dialer.stop().await;
    }

    #[tokio::test]
    async fn test_datagram_delivered_as_unconnected() {
        let (endpoint, mut rx, addr) = start_endpoint().await;

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"hello", addr).unwrap();

        match next_event(&mut rx).await {
            TransportEvent::UnconnectedReceived { from, payload } => {
                assert_eq!(from, sender.local_addr().unwrap());
                assert_eq!(payload, b"hello");
            }
            other => panic!("Expected UnconnectedReceived, got {other:?}"),
        }
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_requires_start() {
        let transport = TcpTransport::new(false);
        assert!(matches!(
            transport.send_broadcast(b"x", 10515).await,
            Err(WireError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_clears() {
        let transport = TcpTransport::new(false);
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = transport.start(0, tx.clone()).await.unwrap();
        let second = transport.start(0, tx).await.unwrap();
        assert_eq!(first, second);

        transport.stop().await;
        assert!(transport.local_addr().is_none());
        transport.stop().await;
    }
}
