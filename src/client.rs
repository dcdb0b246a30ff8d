//! L2TP client
//!
//! The mirror image of the server's handshake: it drives SCCRQ →
//! SCCRP → SCCCN → ICRQ → ICRP → ICCN sequentially, each read guarded
//! by the configured deadline, then hands the socket to a background
//! receive loop. A failed handshake returns the error to the caller
//! and retains no partial state; discard the client and connect again.
//!
//! Once established the client is symmetric to the server: incoming
//! control messages update sequence state (Hello refreshes, StopCCN
//! closes), incoming data messages are unwrapped to PPP and IPv4
//! payloads are forwarded to the packet sink.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::ppp::{self, PacketSink, PROTO_IPV4, PROTO_PAP};
use crate::wire::{
    self, Avp, ControlMessageType, L2tpHeader, AVP_ASSIGNED_SESSION_ID, AVP_ASSIGNED_TUNNEL_ID,
    AVP_CALL_SERIAL_NUMBER, AVP_FRAMING_TYPE, AVP_HOST_NAME, AVP_MESSAGE_TYPE,
    AVP_PROTOCOL_VERSION, AVP_RECEIVE_WINDOW_SIZE, AVP_TX_CONNECT_SPEED, PROTOCOL_VERSION_1_0,
};

/// Callback invoked with every raw IP packet received over the tunnel
pub type PacketCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

const RECV_BUFFER_SIZE: usize = 4096;

/// Mutable connection state, one lock for all of it; the client has no
/// concurrent packet handlers, only the receive loop and API callers
struct ClientState {
    peer_tunnel_id: u16,
    peer_session_id: u16,
    ns: u16,
    nr: u16,
    authenticated: bool,
}

/// An L2TP client endpoint with one tunnel carrying one session
pub struct Client {
    socket: Arc<UdpSocket>,
    remote_addr: SocketAddr,
    tunnel_id: u16,
    session_id: u16,
    state: Mutex<ClientState>,
    sink: Option<Arc<dyn PacketSink>>,
    on_packet: Option<PacketCallback>,
    cancel: CancellationToken,
}

/// Optional collaborators wired into the client's receive path
#[derive(Default)]
pub struct ClientHooks {
    /// Receives every inbound IPv4 packet
    pub sink: Option<Arc<dyn PacketSink>>,
    /// Invoked with every inbound IPv4 packet, alongside the sink
    pub on_packet: Option<PacketCallback>,
}

impl Client {
    /// Connect to an L2TP server: performs the full handshake and
    /// spawns the receive loop
    ///
    /// If credentials are configured, a PAP Authenticate-Request is
    /// sent after the session is up; the verdict arrives asynchronously
    /// via the receive loop (see [`Client::is_authenticated`]).
    ///
    /// # Errors
    ///
    /// Any deadline expiry, malformed response, or socket failure
    /// during the handshake aborts the connect.
    pub async fn connect(
        remote_addr: SocketAddr,
        config: ClientConfig,
        hooks: ClientHooks,
    ) -> Result<Arc<Self>, ClientError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(remote_addr).await?;

        // A fixed ID can be configured for tests; otherwise pick a
        // random nonzero one so clients in one process do not collide.
        let tunnel_id = match config.tunnel_id {
            Some(id) => id,
            None => rand::thread_rng().gen_range(1..=u16::MAX),
        };

        let client = Arc::new(Self {
            socket: Arc::new(socket),
            remote_addr,
            tunnel_id,
            session_id: config.session_id,
            state: Mutex::new(ClientState {
                peer_tunnel_id: 0,
                peer_session_id: 0,
                ns: 0,
                nr: 0,
                authenticated: false,
            }),
            sink: hooks.sink,
            on_packet: hooks.on_packet,
            cancel: CancellationToken::new(),
        });

        client.handshake(&config).await?;

        let loop_client = Arc::clone(&client);
        tokio::spawn(async move {
            loop_client.receive_loop().await;
        });

        Ok(client)
    }

    async fn handshake(&self, config: &ClientConfig) -> Result<(), ClientError> {
        let deadline = config.timeout();

        debug!(tunnel_id = self.tunnel_id, "Sending SCCRQ");
        self.send_control(
            0,
            0,
            ControlMessageType::Sccrq,
            vec![
                Avp::u16_avp(AVP_PROTOCOL_VERSION, PROTOCOL_VERSION_1_0, true),
                Avp::string_avp(AVP_HOST_NAME, &config.hostname, true),
                Avp::u16_avp(AVP_ASSIGNED_TUNNEL_ID, self.tunnel_id, true),
                Avp::u16_avp(AVP_RECEIVE_WINDOW_SIZE, 4, true),
            ],
        )
        .await?;

        let avps = self
            .read_reply(deadline, ControlMessageType::Sccrp, "SCCRP")
            .await?;
        let peer_tunnel_id = find_u16(&avps, AVP_ASSIGNED_TUNNEL_ID).unwrap_or(0);
        self.state.lock().peer_tunnel_id = peer_tunnel_id;
        info!(peer_tunnel_id, "Received SCCRP");

        debug!("Sending SCCCN");
        self.send_control(peer_tunnel_id, 0, ControlMessageType::Scccn, vec![])
            .await?;

        debug!(session_id = self.session_id, "Sending ICRQ");
        self.send_control(
            peer_tunnel_id,
            0,
            ControlMessageType::Icrq,
            vec![
                Avp::u16_avp(AVP_ASSIGNED_SESSION_ID, self.session_id, true),
                Avp::u32_avp(AVP_CALL_SERIAL_NUMBER, 1, true),
            ],
        )
        .await?;

        let avps = self
            .read_reply(deadline, ControlMessageType::Icrp, "ICRP")
            .await?;
        let peer_session_id = find_u16(&avps, AVP_ASSIGNED_SESSION_ID).unwrap_or(0);
        self.state.lock().peer_session_id = peer_session_id;
        info!(peer_session_id, "Received ICRP");

        debug!("Sending ICCN");
        self.send_control(
            peer_tunnel_id,
            peer_session_id,
            ControlMessageType::Iccn,
            vec![
                Avp::u32_avp(AVP_TX_CONNECT_SPEED, 100_000_000, true),
                Avp::u32_avp(AVP_FRAMING_TYPE, 3, true),
            ],
        )
        .await?;

        info!(
            tunnel_id = self.tunnel_id,
            peer_tunnel_id, peer_session_id, "Tunnel established"
        );

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            info!(username, "Sending PAP authentication request");
            self.send_pap_request(username, password).await?;
        }

        Ok(())
    }

    /// Read one control message, enforcing the deadline and the
    /// expected message type
    async fn read_reply(
        &self,
        deadline: std::time::Duration,
        expected: ControlMessageType,
        expecting: &'static str,
    ) -> Result<Vec<Avp>, ClientError> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let n = timeout(deadline, self.socket.recv(&mut buf))
            .await
            .map_err(|_| ClientError::Timeout { expecting })??;

        let (header, consumed) = L2tpHeader::parse(&buf[..n])?;
        if !header.is_control() {
            return Err(ClientError::NotControl);
        }

        let (avps, parse_err) = wire::parse_avps(&buf[consumed..n]);
        if let Some(e) = parse_err {
            return Err(e.into());
        }

        let got = wire::find_message_type(&avps).unwrap_or(0);
        if got != expected.as_u16() {
            return Err(ClientError::UnexpectedMessage {
                expected: expecting,
                expected_code: expected.as_u16(),
                got,
            });
        }

        if header.has_sequence() {
            let mut state = self.state.lock();
            state.nr = header.ns.wrapping_add(1);
        }

        Ok(avps)
    }

    async fn send_control(
        &self,
        tunnel_id: u16,
        session_id: u16,
        message_type: ControlMessageType,
        extra_avps: Vec<Avp>,
    ) -> Result<(), ClientError> {
        let (ns, nr) = {
            let mut state = self.state.lock();
            let ns = state.ns;
            state.ns = state.ns.wrapping_add(1);
            (ns, state.nr)
        };

        let header = L2tpHeader::control(tunnel_id, session_id, ns, nr);
        let mut avps = vec![Avp::u16_avp(AVP_MESSAGE_TYPE, message_type.as_u16(), true)];
        avps.extend(extra_avps);

        let mut packet = header.serialize();
        packet.extend_from_slice(&wire::serialize_avps(&avps));
        wire::patch_length(&mut packet);

        self.socket.send(&packet).await?;
        Ok(())
    }

    async fn send_pap_request(&self, username: &str, password: &str) -> Result<(), ClientError> {
        let pap = ppp::build_pap_request(1, username, password);
        let frame = ppp::encode(PROTO_PAP, &pap.encode());
        self.send_ppp_frame(&frame).await
    }

    /// Wrap a raw IP packet in PPP and L2TP framing and send it
    ///
    /// # Errors
    ///
    /// Returns `NotEstablished` before the handshake has assigned a
    /// peer session ID.
    pub async fn inject_packet(&self, packet: &[u8]) -> Result<(), ClientError> {
        let frame = ppp::encode(PROTO_IPV4, packet);
        self.send_ppp_frame(&frame).await
    }

    async fn send_ppp_frame(&self, frame: &[u8]) -> Result<(), ClientError> {
        let (peer_tunnel_id, peer_session_id) = {
            let state = self.state.lock();
            (state.peer_tunnel_id, state.peer_session_id)
        };
        if peer_session_id == 0 {
            return Err(ClientError::NotEstablished);
        }

        let header = L2tpHeader::data(peer_tunnel_id, peer_session_id);
        let mut packet = header.serialize();
        packet.extend_from_slice(frame);

        self.socket.send(&packet).await?;
        Ok(())
    }

    /// Parse incoming packets until cancelled or the socket fails
    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("Client receive loop cancelled");
                    return;
                }
                result = self.socket.recv(&mut buf) => match result {
                    Ok(n) => self.handle_packet(&buf[..n]),
                    Err(e) => {
                        warn!("Client read failed, stopping receive loop: {e}");
                        return;
                    }
                }
            }
        }
    }

    fn handle_packet(&self, data: &[u8]) {
        let (header, consumed) = match L2tpHeader::parse(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Dropping packet with bad header: {e}");
                return;
            }
        };

        let payload = &data[consumed..];
        if header.is_control() {
            self.handle_control(&header, payload);
        } else {
            self.handle_data(payload);
        }
    }

    fn handle_control(&self, header: &L2tpHeader, payload: &[u8]) {
        let (avps, parse_err) = wire::parse_avps(payload);
        if let Some(e) = parse_err {
            warn!("Dropping control message with bad AVP: {e}");
            return;
        }

        if header.has_sequence() {
            self.state.lock().nr = header.ns.wrapping_add(1);
        }

        let Some(message_type) = wire::find_message_type(&avps) else {
            return;
        };

        match ControlMessageType::from_u16(message_type) {
            Some(ControlMessageType::Hello) => {
                debug!("Received Hello");
            }
            Some(ControlMessageType::StopCcn) => {
                info!("Peer stopped the tunnel");
                self.close();
            }
            other => {
                debug!(message_type, ?other, "Ignoring control message");
            }
        }
    }

    /// Unwrap a data message to its PPP payload and route by protocol
    fn handle_data(&self, payload: &[u8]) {
        let stripped = ppp::strip_address_control(payload);
        let (protocol, data) = match ppp::split_protocol(stripped) {
            Ok(split) => split,
            Err(e) => {
                debug!("Dropping PPP frame: {e}");
                return;
            }
        };

        match protocol {
            PROTO_IPV4 => {
                if let Some(callback) = &self.on_packet {
                    callback(data);
                }
                if let Some(sink) = &self.sink {
                    sink.inject_inbound(protocol, data);
                }
            }
            PROTO_PAP => self.handle_pap(data),
            // The address assignment is pushed by the peer; receiving
            // any IPCP traffic implies authentication succeeded.
            ppp::PROTO_IPCP => {
                debug!("Received IPCP");
                self.state.lock().authenticated = true;
            }
            ppp::PROTO_LCP | ppp::PROTO_CHAP => {
                debug!(protocol, "Ignoring PPP control traffic");
            }
            _ => {
                debug!(protocol, "Unhandled PPP protocol");
            }
        }
    }

    fn handle_pap(&self, data: &[u8]) {
        let Ok(packet) = ppp::CpPacket::parse(data) else {
            debug!("Dropping malformed PAP packet");
            return;
        };
        match packet.code {
            ppp::frame::PAP_AUTH_ACK => {
                info!("PAP authentication successful");
                self.state.lock().authenticated = true;
            }
            ppp::frame::PAP_AUTH_NAK => {
                warn!("PAP authentication failed");
                self.state.lock().authenticated = false;
            }
            code => {
                debug!(code, "Unknown PAP code");
            }
        }
    }

    /// Our tunnel ID
    #[must_use]
    pub fn tunnel_id(&self) -> u16 {
        self.tunnel_id
    }

    /// Our session ID
    #[must_use]
    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    /// The server's tunnel ID, learned from SCCRP
    #[must_use]
    pub fn peer_tunnel_id(&self) -> u16 {
        self.state.lock().peer_tunnel_id
    }

    /// The server's session ID, learned from ICRP
    #[must_use]
    pub fn peer_session_id(&self) -> u16 {
        self.state.lock().peer_session_id
    }

    /// Whether the peer has acknowledged authentication
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state.lock().authenticated
    }

    /// The server address this client is connected to
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Address of the client's local socket
    ///
    /// # Errors
    ///
    /// Returns the socket's error if the address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.socket.local_addr()?)
    }

    /// Stop the receive loop. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn find_u16(avps: &[Avp], avp_type: u16) -> Option<u16> {
    avps.iter()
        .find(|avp| avp.vendor_id == 0 && avp.avp_type == avp_type)
        .and_then(|avp| avp.value_u16().ok())
}
