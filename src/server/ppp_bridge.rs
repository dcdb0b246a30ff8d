//! Bridge between L2TP data messages and the PPP engine
//!
//! IPv4 payloads bypass the engine entirely and go straight to the
//! packet sink; everything else (LCP, PAP, CHAP, IPCP) is delegated to
//! the engine, whose responses are sent back as data messages. After
//! each delegated frame the bridge polls the engine for an
//! authentication verdict and, on success, assigns the session its IP
//! address and pushes an IPCP Configure-Request at the peer.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::ppp::{
    self, build_ipcp_configure_request, PROTO_CHAP, PROTO_IPCP, PROTO_IPV4, PROTO_PAP,
};
use crate::tunnel::{Session, SessionState, Tunnel};

use super::Server;

impl Server {
    /// Process the PPP frame carried by one data message
    pub(crate) async fn handle_ppp_frame(
        &self,
        tunnel: &Arc<Tunnel>,
        session: &Arc<Session>,
        frame: &[u8],
    ) {
        let stripped = ppp::strip_address_control(frame);
        let (protocol, payload) = match ppp::split_protocol(stripped) {
            Ok(split) => split,
            Err(e) => {
                debug!(session_id = session.id(), "Dropping PPP frame: {e}");
                return;
            }
        };

        // User traffic never touches the engine.
        if protocol == PROTO_IPV4 {
            if let Some(callback) = &self.on_packet {
                callback(payload);
            }
            self.sink.inject_inbound(protocol, payload);
            return;
        }

        if (protocol == PROTO_PAP || protocol == PROTO_CHAP)
            && session.state() == SessionState::Established
        {
            session.set_state(SessionState::Authenticating);
        }

        match self.engine.process_frame(protocol, payload) {
            Ok(Some(response)) => {
                let reply = ppp::encode(response.protocol, &response.payload);
                if let Err(e) = self.send_data_message(tunnel, session, &reply).await {
                    warn!(session_id = session.id(), "Failed to send PPP reply: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!(
                    session_id = session.id(),
                    protocol, "PPP engine rejected frame: {e}"
                );
                return;
            }
        }

        match self.engine.try_auth_result() {
            Some(true) => self.complete_authentication(tunnel, session).await,
            Some(false) => {
                session.set_authenticated(false);
                info!(
                    tunnel_id = tunnel.id(),
                    session_id = session.id(),
                    "Session authentication failed"
                );
            }
            None => {}
        }
    }

    /// Mark the session authenticated, give it an address from the
    /// pool, and push the address assignment via IPCP
    async fn complete_authentication(&self, tunnel: &Arc<Tunnel>, session: &Arc<Session>) {
        session.set_authenticated(true);

        let client_ip = match self.pool.allocate(&session.pool_key()) {
            Ok(ip) => ip,
            Err(e) => {
                warn!(
                    tunnel_id = tunnel.id(),
                    session_id = session.id(),
                    "No client IP available: {e}"
                );
                return;
            }
        };
        session.set_client_ip(client_ip);
        session.set_server_ip(self.config.pool.server_ip);

        info!(
            tunnel_id = tunnel.id(),
            session_id = session.id(),
            %client_ip,
            server_ip = %self.config.pool.server_ip,
            "Session authenticated"
        );

        if let Err(e) = self
            .send_ipcp_configure_request(tunnel, session, client_ip)
            .await
        {
            warn!(session_id = session.id(), "Failed to push IPCP address: {e}");
        }
    }

    async fn send_ipcp_configure_request(
        &self,
        tunnel: &Arc<Tunnel>,
        session: &Arc<Session>,
        ip: std::net::Ipv4Addr,
    ) -> Result<(), ServerError> {
        let packet = build_ipcp_configure_request(1, ip);
        let frame = ppp::encode(PROTO_IPCP, &packet.encode());
        self.send_data_message(tunnel, session, &frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::ppp::{
        ChannelPacketSink, DefaultPppEngine, InboundPacket, PppEngine, PppError, PppResponse,
    };
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Engine that counts frames and never replies
    struct CountingEngine {
        frames: AtomicUsize,
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

    fn bridge_fixture(
        engine: Arc<dyn PppEngine>,
    ) -> (
        Arc<Server>,
        Arc<Tunnel>,
        Arc<Session>,
        mpsc::Receiver<InboundPacket>,
    ) {
        let (sink, rx) = ChannelPacketSink::new(16);
        let server = Arc::new(Server::new(ServerConfig::default(), engine, Arc::new(sink)));
        let addr: SocketAddr = "10.1.0.1:1701".parse().unwrap();
        let tunnel = Arc::new(Tunnel::new(1, 9, addr, &server.cancel));
        server.register_tunnel(addr, Arc::clone(&tunnel));
        let session = Arc::new(Session::new(1, 100, &tunnel));
        tunnel.add_session(Arc::clone(&session));
        session.set_state(SessionState::Established);
        (server, tunnel, session, rx)
    }

    #[tokio::test]
    async fn test_ipv4_bypasses_engine_and_reaches_sink() {
        let engine = Arc::new(CountingEngine {
            frames: AtomicUsize::new(0),
        });
        let (server, tunnel, session, mut rx) = bridge_fixture(Arc::clone(&engine) as _);

        let ip_packet: Vec<u8> = (0..20).collect();
        let frame = ppp::encode(PROTO_IPV4, &ip_packet);
        server.handle_ppp_frame(&tunnel, &session, &frame).await;

        let inbound = rx.try_recv().expect("packet forwarded to sink");
        assert_eq!(inbound.protocol, PROTO_IPV4);
        assert_eq!(&inbound.payload[..], &ip_packet[..]);
        assert_eq!(engine.frames.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_control_protocols_reach_engine() {
        let engine = Arc::new(CountingEngine {
            frames: AtomicUsize::new(0),
        });
        let (server, tunnel, session, _rx) = bridge_fixture(Arc::clone(&engine) as _);

        let lcp = crate::ppp::CpPacket {
            code: crate::ppp::CP_CONFIGURE_REQUEST,
            identifier: 1,
            data: bytes::Bytes::new(),
        };
        let frame = ppp::encode(crate::ppp::PROTO_LCP, &lcp.encode());
        server.handle_ppp_frame(&tunnel, &session, &frame).await;

        assert_eq!(engine.frames.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_truncated_frame_dropped() {
        let engine = Arc::new(CountingEngine {
            frames: AtomicUsize::new(0),
        });
        let (server, tunnel, session, _rx) = bridge_fixture(Arc::clone(&engine) as _);

        server
            .handle_ppp_frame(&tunnel, &session, &[0xFF])
            .await;
        assert_eq!(engine.frames.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pap_success_assigns_ip() {
        let engine = Arc::new(DefaultPppEngine::accept_all());
        let (server, tunnel, session, _rx) = bridge_fixture(engine as _);

        let pap = crate::ppp::build_pap_request(1, "alice", "secret");
        let frame = ppp::encode(PROTO_PAP, &pap.encode());
        server.handle_ppp_frame(&tunnel, &session, &frame).await;

        assert!(session.is_authenticated());
        assert_eq!(session.state(), SessionState::Authenticated);
        let ip = session.client_ip().expect("client IP assigned");
        assert_eq!(server.pool().allocation(&session.pool_key()), Some(ip));
        assert_eq!(session.server_ip(), Some(server.config.pool.server_ip));
    }

    #[tokio::test]
    async fn test_pap_failure_marks_session() {
        let engine = Arc::new(DefaultPppEngine::new(Box::new(|user, pass| {
            user == "alice" && pass == "secret"
        })));
        let (server, tunnel, session, _rx) = bridge_fixture(engine as _);

        let pap = crate::ppp::build_pap_request(1, "mallory", "wrong");
        let frame = ppp::encode(PROTO_PAP, &pap.encode());
        server.handle_ppp_frame(&tunnel, &session, &frame).await;

        assert!(!session.is_authenticated());
        assert_eq!(session.state(), SessionState::AuthFailed);
        assert!(server.pool().allocation(&session.pool_key()).is_none());
    }
}
