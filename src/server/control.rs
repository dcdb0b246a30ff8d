//! Control-message dispatch
//!
//! One handler per control message type the server participates in.
//! Handlers never reply with errors: a message that cannot be acted on
//! is logged and dropped, matching UDP's lack of connection state.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::tunnel::{Session, SessionState, Tunnel, TunnelState};
use crate::wire::{
    self, Avp, ControlMessageType, L2tpHeader, AVP_ASSIGNED_SESSION_ID, AVP_ASSIGNED_TUNNEL_ID,
    AVP_BEARER_CAPABILITIES, AVP_FIRMWARE_REVISION, AVP_FRAMING_CAPABILITIES, AVP_HOST_NAME,
    AVP_PROTOCOL_VERSION, AVP_RECEIVE_WINDOW_SIZE, AVP_VENDOR_NAME, PROTOCOL_VERSION_1_0,
};

use super::Server;

/// First standard AVP with the given type in an IETF (vendor 0) scope
fn find_avp(avps: &[Avp], avp_type: u16) -> Option<&Avp> {
    avps.iter()
        .find(|avp| avp.vendor_id == 0 && avp.avp_type == avp_type)
}

impl Server {
    /// Decode the AVP list and dispatch on the MessageType AVP
    pub(crate) async fn handle_control_message(
        &self,
        header: &L2tpHeader,
        payload: &[u8],
        remote_addr: SocketAddr,
    ) {
        let (avps, parse_err) = wire::parse_avps(payload);
        if let Some(e) = parse_err {
            self.stats.record_decode_error();
            warn!(%remote_addr, parsed = avps.len(), "Dropping control message with bad AVP: {e}");
            return;
        }

        let Some(message_type) = wire::find_message_type(&avps) else {
            warn!(%remote_addr, "Dropping control message without MessageType AVP");
            return;
        };

        // Sequence numbers are tracked per tunnel; a message arriving
        // before the tunnel exists (SCCRQ) has nothing to validate
        // against yet.
        if let Some(tunnel) = self.tunnel_by_addr(remote_addr) {
            if header.has_sequence() {
                tunnel.validate_sequence(header.ns);
            }
            tunnel.touch();
        }

        let Some(message_type) = ControlMessageType::from_u16(message_type) else {
            warn!(%remote_addr, message_type, "Dropping unknown control message type");
            return;
        };

        debug!(%remote_addr, ?message_type, ns = header.ns, nr = header.nr, "Received control message");

        match message_type {
            ControlMessageType::Sccrq => self.handle_sccrq(&avps, remote_addr).await,
            ControlMessageType::Scccn => self.handle_scccn(remote_addr),
            ControlMessageType::StopCcn => self.handle_stopccn(remote_addr),
            ControlMessageType::Hello => self.handle_hello(remote_addr),
            ControlMessageType::Icrq => self.handle_icrq(&avps, remote_addr).await,
            ControlMessageType::Iccn => self.handle_iccn(header, remote_addr),
            ControlMessageType::Cdn => self.handle_cdn(header, remote_addr),
            ControlMessageType::Ocrq | ControlMessageType::Ocrp | ControlMessageType::Occn => {
                warn!(%remote_addr, ?message_type, "Outgoing calls not supported, dropping");
            }
            ControlMessageType::Sccrp | ControlMessageType::Icrp => {
                // Replies to requests this server never sends.
                debug!(%remote_addr, ?message_type, "Ignoring unexpected reply");
            }
        }
    }

    /// SCCRQ: create the tunnel and reply with SCCRP
    async fn handle_sccrq(&self, avps: &[Avp], remote_addr: SocketAddr) {
        let peer_tunnel_id = find_avp(avps, AVP_ASSIGNED_TUNNEL_ID)
            .and_then(|avp| avp.value_u16().ok())
            .unwrap_or(0);
        let peer_hostname = find_avp(avps, AVP_HOST_NAME)
            .map(Avp::value_string)
            .unwrap_or_default();

        let tunnel_id = self.allocate_tunnel_id();
        let tunnel = Arc::new(Tunnel::new(
            tunnel_id,
            peer_tunnel_id,
            remote_addr,
            &self.cancel,
        ));
        self.register_tunnel(remote_addr, Arc::clone(&tunnel));

        info!(
            tunnel_id,
            peer_tunnel_id,
            peer_hostname,
            %remote_addr,
            "Tunnel requested"
        );

        if let Err(e) = self.send_sccrp(&tunnel).await {
            warn!(tunnel_id, "Failed to send SCCRP: {e}");
        }
    }

    /// SCCCN: the peer confirms the tunnel
    fn handle_scccn(&self, remote_addr: SocketAddr) {
        let Some(tunnel) = self.tunnel_by_addr(remote_addr) else {
            return;
        };
        tunnel.set_state(TunnelState::Established);
        info!(tunnel_id = tunnel.id(), %remote_addr, "Tunnel established");
    }

    /// StopCCN: tear the tunnel down, sessions included
    fn handle_stopccn(&self, remote_addr: SocketAddr) {
        if let Some(tunnel) = self.remove_tunnel(remote_addr) {
            info!(tunnel_id = tunnel.id(), %remote_addr, "Tunnel stopped by peer");
        }
    }

    /// Hello: keepalive, refreshes the idle timer
    fn handle_hello(&self, remote_addr: SocketAddr) {
        if let Some(tunnel) = self.tunnel_by_addr(remote_addr) {
            tunnel.touch();
        }
    }

    /// ICRQ: create a session within the tunnel and reply with ICRP
    async fn handle_icrq(&self, avps: &[Avp], remote_addr: SocketAddr) {
        let Some(tunnel) = self.tunnel_by_addr(remote_addr) else {
            warn!(%remote_addr, "ICRQ for unknown tunnel, dropping");
            return;
        };

        let peer_session_id = find_avp(avps, AVP_ASSIGNED_SESSION_ID)
            .and_then(|avp| avp.value_u16().ok())
            .unwrap_or(0);

        let session_id = self.allocate_session_id();
        let session = Arc::new(Session::new(session_id, peer_session_id, &tunnel));
        tunnel.add_session(Arc::clone(&session));
        self.stats.record_session_created();

        info!(
            tunnel_id = tunnel.id(),
            session_id, peer_session_id, "Session requested"
        );

        if let Err(e) = self.send_icrp(&tunnel, &session).await {
            warn!(session_id, "Failed to send ICRP: {e}");
        }
    }

    /// ICCN: the peer confirms the session; PPP traffic may now flow
    fn handle_iccn(&self, header: &L2tpHeader, remote_addr: SocketAddr) {
        let Some(tunnel) = self.tunnel_by_addr(remote_addr) else {
            return;
        };
        let Some(session) = tunnel.session(header.session_id) else {
            return;
        };
        // A retransmitted or late ICCN must not rewind a session that
        // has already progressed to authentication.
        if session.state() == SessionState::Created {
            session.set_state(SessionState::Established);
        }
        session.touch();
        info!(
            tunnel_id = tunnel.id(),
            session_id = session.id(),
            "Session established"
        );
    }

    /// CDN: the peer disconnects one session; its IP goes back to the
    /// pool
    fn handle_cdn(&self, header: &L2tpHeader, remote_addr: SocketAddr) {
        let Some(tunnel) = self.tunnel_by_addr(remote_addr) else {
            return;
        };
        let Some(session) = tunnel.session(header.session_id) else {
            return;
        };

        self.pool.release(&session.pool_key());
        tunnel.remove_session(session.id());
        info!(
            tunnel_id = tunnel.id(),
            session_id = session.id(),
            "Session disconnected by peer"
        );
    }

    async fn send_sccrp(&self, tunnel: &Tunnel) -> Result<(), ServerError> {
        let avps = vec![
            Avp::u16_avp(AVP_PROTOCOL_VERSION, PROTOCOL_VERSION_1_0, true),
            Avp::u32_avp(AVP_FRAMING_CAPABILITIES, 0x3, true),
            Avp::u32_avp(AVP_BEARER_CAPABILITIES, 0x3, true),
            Avp::u16_avp(AVP_FIRMWARE_REVISION, 1, false),
            Avp::string_avp(AVP_HOST_NAME, &self.config.hostname, true),
            Avp::string_avp(AVP_VENDOR_NAME, &self.config.vendor_name, false),
            Avp::u16_avp(AVP_ASSIGNED_TUNNEL_ID, tunnel.id(), true),
            Avp::u16_avp(AVP_RECEIVE_WINDOW_SIZE, self.config.receive_window, true),
        ];
        self.send_control_message(tunnel, 0, ControlMessageType::Sccrp, avps)
            .await
    }

    async fn send_icrp(&self, tunnel: &Tunnel, session: &Session) -> Result<(), ServerError> {
        let avps = vec![Avp::u16_avp(AVP_ASSIGNED_SESSION_ID, session.id(), true)];
        self.send_control_message(tunnel, session.peer_id(), ControlMessageType::Icrp, avps)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::ppp::{ChannelPacketSink, DefaultPppEngine};
    use crate::wire::AVP_MESSAGE_TYPE;
    use bytes::BytesMut;

    fn test_server() -> Arc<Server> {
        let (sink, _rx) = ChannelPacketSink::new(16);
        Arc::new(Server::new(
            ServerConfig::default(),
            Arc::new(DefaultPppEngine::accept_all()),
            Arc::new(sink),
        ))
    }

    fn control_packet(
        message_type: ControlMessageType,
        tunnel_id: u16,
        session_id: u16,
        ns: u16,
        extra_avps: Vec<Avp>,
    ) -> BytesMut {
        let header = L2tpHeader::control(tunnel_id, session_id, ns, 0);
        let mut avps = vec![Avp::u16_avp(AVP_MESSAGE_TYPE, message_type.as_u16(), true)];
        avps.extend(extra_avps);
        let mut packet = header.serialize();
        packet.extend_from_slice(&wire::serialize_avps(&avps));
        wire::patch_length(&mut packet);
        packet
    }

    #[tokio::test]
    async fn test_sccrq_creates_tunnel() {
        let server = test_server();
        let addr: SocketAddr = "10.0.0.1:1701".parse().unwrap();
        let packet = control_packet(
            ControlMessageType::Sccrq,
            0,
            0,
            0,
            vec![
                Avp::u16_avp(AVP_ASSIGNED_TUNNEL_ID, 42, true),
                Avp::string_avp(AVP_HOST_NAME, "peer", true),
            ],
        );

        // Not started, so the SCCRP send fails, but the tunnel must
        // exist regardless.
        server.handle_packet(&packet, addr).await;

        let tunnel = server.tunnel_by_addr(addr).expect("tunnel registered");
        assert_eq!(tunnel.peer_id(), 42);
        assert_eq!(tunnel.state(), TunnelState::AwaitingScccn);
        assert_eq!(server.stats_snapshot().tunnels_created, 1);
    }

    #[tokio::test]
    async fn test_scccn_establishes_tunnel() {
        let server = test_server();
        let addr: SocketAddr = "10.0.0.2:1701".parse().unwrap();
        let sccrq = control_packet(
            ControlMessageType::Sccrq,
            0,
            0,
            0,
            vec![Avp::u16_avp(AVP_ASSIGNED_TUNNEL_ID, 7, true)],
        );
        server.handle_packet(&sccrq, addr).await;

        let tunnel = server.tunnel_by_addr(addr).unwrap();
        let scccn = control_packet(ControlMessageType::Scccn, tunnel.id(), 0, 1, vec![]);
        server.handle_packet(&scccn, addr).await;

        assert_eq!(tunnel.state(), TunnelState::Established);
    }

    #[tokio::test]
    async fn test_icrq_creates_session() {
        let server = test_server();
        let addr: SocketAddr = "10.0.0.3:1701".parse().unwrap();
        let sccrq = control_packet(
            ControlMessageType::Sccrq,
            0,
            0,
            0,
            vec![Avp::u16_avp(AVP_ASSIGNED_TUNNEL_ID, 7, true)],
        );
        server.handle_packet(&sccrq, addr).await;
        let tunnel = server.tunnel_by_addr(addr).unwrap();

        let icrq = control_packet(
            ControlMessageType::Icrq,
            tunnel.id(),
            0,
            1,
            vec![Avp::u16_avp(AVP_ASSIGNED_SESSION_ID, 100, true)],
        );
        server.handle_packet(&icrq, addr).await;

        assert_eq!(tunnel.session_count(), 1);
        let session = tunnel.sessions().pop().unwrap();
        assert_eq!(session.peer_id(), 100);
        assert_eq!(server.stats_snapshot().sessions_created, 1);
    }

    #[tokio::test]
    async fn test_iccn_establishes_session() {
        let server = test_server();
        let addr: SocketAddr = "10.0.0.4:1701".parse().unwrap();
        let sccrq = control_packet(
            ControlMessageType::Sccrq,
            0,
            0,
            0,
            vec![Avp::u16_avp(AVP_ASSIGNED_TUNNEL_ID, 7, true)],
        );
        server.handle_packet(&sccrq, addr).await;
        let tunnel = server.tunnel_by_addr(addr).unwrap();

        let icrq = control_packet(
            ControlMessageType::Icrq,
            tunnel.id(),
            0,
            1,
            vec![Avp::u16_avp(AVP_ASSIGNED_SESSION_ID, 100, true)],
        );
        server.handle_packet(&icrq, addr).await;
        let session = tunnel.sessions().pop().unwrap();

        let iccn = control_packet(ControlMessageType::Iccn, tunnel.id(), session.id(), 2, vec![]);
        server.handle_packet(&iccn, addr).await;

        assert_eq!(session.state(), SessionState::Established);
    }

    #[tokio::test]
    async fn test_cdn_removes_session_and_releases_ip() {
        let server = test_server();
        let addr: SocketAddr = "10.0.0.5:1701".parse().unwrap();
        let sccrq = control_packet(
            ControlMessageType::Sccrq,
            0,
            0,
            0,
            vec![Avp::u16_avp(AVP_ASSIGNED_TUNNEL_ID, 7, true)],
        );
        server.handle_packet(&sccrq, addr).await;
        let tunnel = server.tunnel_by_addr(addr).unwrap();

        let icrq = control_packet(
            ControlMessageType::Icrq,
            tunnel.id(),
            0,
            1,
            vec![Avp::u16_avp(AVP_ASSIGNED_SESSION_ID, 100, true)],
        );
        server.handle_packet(&icrq, addr).await;
        let session = tunnel.sessions().pop().unwrap();
        server.pool().allocate(&session.pool_key()).unwrap();

        let cdn = control_packet(ControlMessageType::Cdn, tunnel.id(), session.id(), 2, vec![]);
        server.handle_packet(&cdn, addr).await;

        assert_eq!(tunnel.session_count(), 0);
        assert!(server.pool().allocation(&session.pool_key()).is_none());
    }

    #[tokio::test]
    async fn test_stopccn_removes_tunnel() {
        let server = test_server();
        let addr: SocketAddr = "10.0.0.6:1701".parse().unwrap();
        let sccrq = control_packet(
            ControlMessageType::Sccrq,
            0,
            0,
            0,
            vec![Avp::u16_avp(AVP_ASSIGNED_TUNNEL_ID, 7, true)],
        );
        server.handle_packet(&sccrq, addr).await;
        let tunnel = server.tunnel_by_addr(addr).unwrap();

        let stopccn = control_packet(ControlMessageType::StopCcn, tunnel.id(), 0, 1, vec![]);
        server.handle_packet(&stopccn, addr).await;

        assert!(server.tunnel_by_addr(addr).is_none());
        assert_eq!(tunnel.state(), TunnelState::Stopped);
    }

    #[tokio::test]
    async fn test_unknown_message_type_dropped() {
        let server = test_server();
        let addr: SocketAddr = "10.0.0.7:1701".parse().unwrap();
        let header = L2tpHeader::control(0, 0, 0, 0);
        let avps = vec![Avp::u16_avp(AVP_MESSAGE_TYPE, 999, true)];
        let mut packet = header.serialize();
        packet.extend_from_slice(&wire::serialize_avps(&avps));
        wire::patch_length(&mut packet);

        server.handle_packet(&packet, addr).await;
        assert!(server.tunnel_by_addr(addr).is_none());
    }

    #[tokio::test]
    async fn test_control_without_message_type_dropped() {
        let server = test_server();
        let addr: SocketAddr = "10.0.0.8:1701".parse().unwrap();
        let header = L2tpHeader::control(0, 0, 0, 0);
        let avps = vec![Avp::string_avp(AVP_HOST_NAME, "peer", true)];
        let mut packet = header.serialize();
        packet.extend_from_slice(&wire::serialize_avps(&avps));
        wire::patch_length(&mut packet);

        server.handle_packet(&packet, addr).await;
        assert!(server.tunnel_by_addr(addr).is_none());
    }

    #[tokio::test]
    async fn test_out_of_order_sequence_resynchronizes() {
        let server = test_server();
        let addr: SocketAddr = "10.0.0.9:1701".parse().unwrap();
        let sccrq = control_packet(
            ControlMessageType::Sccrq,
            0,
            0,
            0,
            vec![Avp::u16_avp(AVP_ASSIGNED_TUNNEL_ID, 7, true)],
        );
        server.handle_packet(&sccrq, addr).await;
        let tunnel = server.tunnel_by_addr(addr).unwrap();
        assert_eq!(tunnel.nr(), 0);

        // Ns jumps ahead; the message is still processed and Nr
        // resynchronizes to Ns + 1.
        let hello = control_packet(ControlMessageType::Hello, tunnel.id(), 0, 9, vec![]);
        server.handle_packet(&hello, addr).await;
        assert_eq!(tunnel.nr(), 10);
    }
}
