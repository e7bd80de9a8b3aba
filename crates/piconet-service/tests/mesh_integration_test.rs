//! Integration tests for discovery and messaging across several services.
//!
//! Every node runs the real service (discovery engine, session bus, pump) on
//! a shared in-process `MemoryNetwork`, each with its own host address and
//! the same port, so whole-mesh behaviour is exercised without sockets.

use piconet_service::{
    handler, DiscoveryState, PicoNetService, ServiceConfig, ServiceError, ServiceEvent,
};
use piconet_wire::{MemoryNetwork, WireError};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PORT: u16 = 9000;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn node(network: &MemoryNetwork, ip: &str, app_id: &str) -> PicoNetService {
    node_with_interval(network, ip, app_id, 100)
}

fn node_with_interval(
    network: &MemoryNetwork,
    ip: &str,
    app_id: &str,
    broadcast_interval_ms: u64,
) -> PicoNetService {
    let ip: IpAddr = ip.parse().unwrap();
    let config = ServiceConfig {
        network_port: PORT,
        broadcast_interval_ms,
        pump_interval_ms: 10,
        ..ServiceConfig::with_application_id(app_id)
    };
    PicoNetService::with_transport(
        config,
        Arc::new(network.transport(ip)),
        [ip].into_iter().collect(),
    )
    .unwrap()
}

/// Record every notification as a short string.
fn notifications(service: &PicoNetService) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    service.observe(Arc::new(move |event: &ServiceEvent| {
        let entry = match event {
            ServiceEvent::Started => "started".to_string(),
            ServiceEvent::Stopped => "stopped".to_string(),
            ServiceEvent::PeerConnected(peer) => format!("connected:{}", peer.ip()),
            ServiceEvent::PeerDisconnected(peer) => format!("disconnected:{}", peer.ip()),
            ServiceEvent::ConnectedPeersChanged(n) => format!("count:{n}"),
        };
        sink.lock().unwrap().push(entry);
    }));
    log
}

/// Record payloads delivered for `event_name`.
fn inbox(service: &PicoNetService, event_name: &str) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    service.subscribe(
        event_name,
        handler(move |payload| sink.lock().unwrap().push(payload.to_string())),
    );
    log
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn connected_pair(network: &MemoryNetwork) -> (PicoNetService, PicoNetService) {
    let a = node(network, "10.0.0.1", "X");
    let b = node(network, "10.0.0.2", "X");
    a.start_service().await.unwrap();
    b.start_service().await.unwrap();
    wait_until("A and B to connect", || {
        a.connected_peer_count() == 1 && b.connected_peer_count() == 1
    })
    .await;
    (a, b)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_same_application_nodes_connect() {
    let network = MemoryNetwork::new();
    let a = node(&network, "10.0.0.1", "X");
    let b = node(&network, "10.0.0.2", "X");
    let a_log = notifications(&a);
    let b_log = notifications(&b);

    a.start_service().await.unwrap();
    b.start_service().await.unwrap();
    wait_until("A and B to connect", || {
        a.connected_peer_count() == 1 && b.connected_peer_count() == 1
    })
    .await;

    // Several more broadcast cycles must not create a second link.
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(a.connected_peer_count(), 1);
    assert_eq!(b.connected_peer_count(), 1);

    assert_eq!(
        *a_log.lock().unwrap(),
        vec!["started", "connected:10.0.0.2", "count:1"]
    );
    assert_eq!(
        *b_log.lock().unwrap(),
        vec!["started", "connected:10.0.0.1", "count:1"]
    );
    assert_eq!(
        a.discovery().peer_state("10.0.0.2".parse().unwrap()),
        DiscoveryState::Connected
    );
    assert!(a.discovery().pending_peers().is_empty());
}

#[tokio::test]
async fn test_nodes_connect_within_one_broadcast_interval() {
    let network = MemoryNetwork::new();
    let interval = Duration::from_millis(1000);
    let a = node_with_interval(&network, "10.0.0.1", "X", 1000);
    let b = node_with_interval(&network, "10.0.0.2", "X", 1000);

    a.start_service().await.unwrap();
    let started = tokio::time::Instant::now();
    b.start_service().await.unwrap();
    wait_until("A and B to connect", || {
        a.connected_peer_count() == 1 && b.connected_peer_count() == 1
    })
    .await;

    assert!(
        started.elapsed() < interval,
        "connected after {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_oversized_event_refused_and_peer_kept() {
    let network = MemoryNetwork::new();
    let (a, b) = connected_pair(&network).await;
    let received = inbox(&b, "BULK");
    let huge = "x".repeat(17 * 1024 * 1024);

    assert!(matches!(
        a.send_to_all("BULK", &huge),
        Err(ServiceError::Wire(WireError::MessageTooLarge { .. }))
    ));
    assert_eq!(a.connected_peer_count(), 1);

    a.send_to_all("BULK", "small").unwrap();
    wait_until("B to receive", || !received.lock().unwrap().is_empty()).await;
    assert_eq!(*received.lock().unwrap(), vec!["small"]);
    assert_eq!(a.connected_peer_count(), 1);
    assert_eq!(b.connected_peer_count(), 1);
}

#[tokio::test]
async fn test_different_application_ids_never_connect() {
    let network = MemoryNetwork::new();
    let a = node(&network, "10.0.0.1", "X");
    let c = node(&network, "10.0.0.3", "Y");
    a.start_service().await.unwrap();
    c.start_service().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.connected_peer_count(), 0);
    assert_eq!(c.connected_peer_count(), 0);
    assert!(a.discovery().pending_peers().is_empty());
    assert!(c.discovery().pending_peers().is_empty());
}

#[tokio::test]
async fn test_message_delivered_exactly_once() {
    let network = MemoryNetwork::new();
    let (a, b) = connected_pair(&network).await;
    let received = inbox(&b, "MESSAGE_EVENT");
    let echoed = inbox(&a, "MESSAGE_EVENT");

    assert_eq!(a.send_to_all("MESSAGE_EVENT", "hi").unwrap(), 1);
    wait_until("B to receive", || !received.lock().unwrap().is_empty()).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*received.lock().unwrap(), vec!["hi"]);
    // The sender's own subscribers are not invoked.
    assert!(echoed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_payload_delivered() {
    let network = MemoryNetwork::new();
    let (a, b) = connected_pair(&network).await;
    let received = inbox(&b, "PING");

    a.send_to_all("PING", "").unwrap();
    wait_until("B to receive", || !received.lock().unwrap().is_empty()).await;
    assert_eq!(*received.lock().unwrap(), vec![""]);
}

#[tokio::test]
async fn test_send_to_peer_reaches_only_that_peer() {
    let network = MemoryNetwork::new();
    let a = node(&network, "10.0.0.1", "X");
    let b = node(&network, "10.0.0.2", "X");
    let c = node(&network, "10.0.0.3", "X");
    for service in [&a, &b, &c] {
        service.start_service().await.unwrap();
    }
    wait_until("full mesh", || {
        [&a, &b, &c].iter().all(|s| s.connected_peer_count() == 2)
    })
    .await;

    let at_b = inbox(&b, "DIRECT");
    let at_c = inbox(&c, "DIRECT");
    let b_ip: IpAddr = "10.0.0.2".parse().unwrap();
    let to_b = a
        .connected_peers()
        .into_iter()
        .find(|p| p.ip() == b_ip)
        .unwrap();

    a.send_to_peer(&to_b, "DIRECT", "only b").unwrap();
    wait_until("B to receive", || !at_b.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*at_b.lock().unwrap(), vec!["only b"]);
    assert!(at_c.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let network = MemoryNetwork::new();
    let (a, b) = connected_pair(&network).await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let h = handler(move |payload| sink.lock().unwrap().push(payload.to_string()));
    b.subscribe("E", h.clone());

    a.send_to_all("E", "first").unwrap();
    wait_until("first delivery", || received.lock().unwrap().len() == 1).await;

    assert!(b.unsubscribe("E", &h));
    a.send_to_all("E", "second").unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(*received.lock().unwrap(), vec!["first"]);
}

#[tokio::test]
async fn test_disconnect_and_rediscovery() {
    let network = MemoryNetwork::new();
    let (a, b) = connected_pair(&network).await;
    let a_log = notifications(&a);
    let b_ip: IpAddr = "10.0.0.2".parse().unwrap();

    b.stop_service().await;
    assert_eq!(b.connected_peer_count(), 0);
    wait_until("A to notice", || a.connected_peer_count() == 0).await;

    assert_eq!(
        *a_log.lock().unwrap(),
        vec!["disconnected:10.0.0.2", "count:0"]
    );
    assert_eq!(a.discovery().peer_state(b_ip), DiscoveryState::Unknown);

    b.start_service().await.unwrap();
    wait_until("A and B to reconnect", || {
        a.connected_peer_count() == 1 && b.connected_peer_count() == 1
    })
    .await;
}

#[tokio::test]
async fn test_stop_reports_zero_peers() {
    let network = MemoryNetwork::new();
    let (a, _b) = connected_pair(&network).await;
    let a_log = notifications(&a);

    a.stop_service().await;
    assert_eq!(*a_log.lock().unwrap(), vec!["count:0", "stopped"]);
    assert!(matches!(
        a.send_to_all("E", "p"),
        Err(piconet_service::ServiceError::NotRunning)
    ));
}

#[tokio::test]
async fn test_dropped_service_leaves_network() {
    let network = MemoryNetwork::new();
    let (a, b) = connected_pair(&network).await;

    drop(b);
    wait_until("A to notice", || a.connected_peer_count() == 0).await;
    wait_until("B to unregister", || network.node_count() == 1).await;
}
