//! End-to-end tests over a loopback UDP socket
//!
//! A real server and a real client exchange the full L2TP handshake,
//! PPP authentication, and data traffic.
//!
//! ```bash
//! cargo test --test e2e
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_l2tp::client::{Client, ClientHooks};
use rust_l2tp::config::{ClientConfig, ServerConfig};
use rust_l2tp::ppp::{
    ChannelPacketSink, DefaultPppEngine, InboundPacket, PppEngine, PppError, PppResponse,
};
use rust_l2tp::server::Server;
use rust_l2tp::tunnel::SessionState;
use tokio::sync::mpsc;

/// Engine that counts delegated frames and never responds; user
/// traffic must never show up here
struct CountingEngine {
    frames: AtomicUsize,
}

impl CountingEngine {
    fn new() -> Self {
        Self {
            frames: AtomicUsize::new(0),
        }
    }
}

impl PppEngine for CountingEngine {
    fn process_frame(
        &self,
        _protocol: u16,
        _payload: &[u8],
    ) -> Result<Option<PppResponse>, PppError> {
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    fn try_auth_result(&self) -> Option<bool> {
        None
    }
}

async fn start_server(
    engine: Arc<dyn PppEngine>,
) -> (Arc<Server>, mpsc::Receiver<InboundPacket>, std::net::SocketAddr) {
    let mut config = ServerConfig::default();
    config.listen = "127.0.0.1:0".parse().unwrap();

    let (sink, rx) = ChannelPacketSink::new(64);
    let server = Arc::new(Server::new(config, engine, Arc::new(sink)));
    server.start().await.expect("server start");
    let addr = server.local_addr().expect("bound address");
    (server, rx, addr)
}

fn client_config(tunnel_id: u16) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.tunnel_id = Some(tunnel_id);
    config.session_id = 100;
    config.timeout_secs = 5;
    config
}

/// Poll until `predicate` holds or the deadline passes
async fn wait_until(predicate: impl Fn() -> bool) {
    for _ in 0..100 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test]
async fn test_handshake_establishes_tunnel_and_session() {
    let (server, _rx, addr) = start_server(Arc::new(CountingEngine::new())).await;

    let client = Client::connect(addr, client_config(1), ClientHooks::default())
        .await
        .expect("handshake");

    assert_ne!(client.peer_tunnel_id(), 0);
    assert_ne!(client.peer_session_id(), 0);

    // The server processes ICCN asynchronously.
    let client_addr = client.local_addr().unwrap();
    wait_until(|| {
        server
            .tunnel_by_addr(client_addr)
            .and_then(|t| t.sessions().pop())
            .is_some_and(|s| s.state() == SessionState::Established)
    })
    .await;

    let tunnel = server.tunnel_by_addr(client_addr).unwrap();
    assert_eq!(tunnel.peer_id(), 1);
    assert_eq!(tunnel.sessions().pop().unwrap().peer_id(), 100);

    server.stop();
}

#[tokio::test]
async fn test_ipv4_data_reaches_sink_unmodified_and_bypasses_engine() {
    let engine = Arc::new(CountingEngine::new());
    let (server, mut rx, addr) = start_server(Arc::clone(&engine) as _).await;

    let client = Client::connect(addr, client_config(2), ClientHooks::default())
        .await
        .expect("handshake");

    let ip_packet: Vec<u8> = (0..20).collect();
    client.inject_packet(&ip_packet).await.expect("inject");

    let inbound = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("sink delivery")
        .expect("channel open");
    assert_eq!(inbound.protocol, 0x0021);
    assert_eq!(&inbound.payload[..], &ip_packet[..]);

    // The IPv4 frame must not have been delegated.
    assert_eq!(engine.frames.load(Ordering::SeqCst), 0);

    server.stop();
}

#[tokio::test]
async fn test_pap_authentication_assigns_ip() {
    let engine = Arc::new(DefaultPppEngine::new(Box::new(|user, pass| {
        user == "alice" && pass == "secret"
    })));
    let (server, _rx, addr) = start_server(engine as _).await;

    let mut config = client_config(3);
    config.username = Some("alice".to_string());
    config.password = Some("secret".to_string());
    let client = Client::connect(addr, config, ClientHooks::default())
        .await
        .expect("handshake");

    // The PAP Ack and the pushed IPCP Configure-Request both flip the
    // client's flag.
    wait_until(|| client.is_authenticated()).await;

    let client_addr = client.local_addr().unwrap();
    let tunnel = server.tunnel_by_addr(client_addr).unwrap();
    let session = tunnel.sessions().pop().unwrap();
    assert!(session.is_authenticated());
    assert_eq!(session.state(), SessionState::Authenticated);
    let ip = session.client_ip().expect("IP assigned");
    assert_eq!(server.pool().allocation(&session.pool_key()), Some(ip));

    server.stop();
}

#[tokio::test]
async fn test_pap_rejection_leaves_session_unauthenticated() {
    let engine = Arc::new(DefaultPppEngine::new(Box::new(|user, pass| {
        user == "alice" && pass == "secret"
    })));
    let (server, _rx, addr) = start_server(engine as _).await;

    let mut config = client_config(4);
    config.username = Some("mallory".to_string());
    config.password = Some("wrong".to_string());
    let client = Client::connect(addr, config, ClientHooks::default())
        .await
        .expect("handshake");

    let client_addr = client.local_addr().unwrap();
    wait_until(|| {
        server
            .tunnel_by_addr(client_addr)
            .and_then(|t| t.sessions().pop())
            .is_some_and(|s| s.state() == SessionState::AuthFailed)
    })
    .await;

    let session = server
        .tunnel_by_addr(client_addr)
        .unwrap()
        .sessions()
        .pop()
        .unwrap();
    assert!(!session.is_authenticated());
    // The session stays open; only CDN or timeout removes it.
    assert!(server.pool().allocation(&session.pool_key()).is_none());

    server.stop();
}

#[tokio::test]
async fn test_inbound_ipv4_reaches_client_sink() {
    let (server, _rx, addr) = start_server(Arc::new(CountingEngine::new())).await;

    let (client_sink, mut client_rx) = ChannelPacketSink::new(16);
    let hooks = ClientHooks {
        sink: Some(Arc::new(client_sink)),
        on_packet: None,
    };
    let client = Client::connect(addr, client_config(5), hooks)
        .await
        .expect("handshake");

    // Wait for the server to learn the session, then push a packet
    // down to the client.
    let client_addr = client.local_addr().unwrap();
    wait_until(|| {
        server
            .tunnel_by_addr(client_addr)
            .is_some_and(|t| t.session_count() > 0)
    })
    .await;
    let tunnel = server.tunnel_by_addr(client_addr).unwrap();
    let session = tunnel.sessions().pop().unwrap();

    let ip_packet = vec![0x45u8; 20];
    let frame = rust_l2tp::ppp::encode(rust_l2tp::ppp::PROTO_IPV4, &ip_packet);
    server
        .send_ppp_frame(tunnel.id(), session.id(), &frame)
        .await
        .expect("send downstream");

    let inbound = tokio::time::timeout(Duration::from_secs(5), client_rx.recv())
        .await
        .expect("client sink delivery")
        .expect("channel open");
    assert_eq!(&inbound.payload[..], &ip_packet[..]);

    server.stop();
}

#[tokio::test]
async fn test_concurrent_clients_get_distinct_tunnels() {
    let (server, _rx, addr) = start_server(Arc::new(CountingEngine::new())).await;

    let mut handles = Vec::new();
    for i in 0..8u16 {
        handles.push(tokio::spawn(async move {
            Client::connect(addr, client_config(10 + i), ClientHooks::default())
                .await
                .expect("handshake")
        }));
    }

    let mut peer_ids = std::collections::HashSet::new();
    for handle in handles {
        let client = handle.await.unwrap();
        assert!(peer_ids.insert(client.peer_tunnel_id()), "duplicate tunnel ID");
    }

    assert_eq!(server.tunnel_count(), 8);
    server.stop();
}
