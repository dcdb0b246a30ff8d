//! L2TP server
//!
//! The server owns the UDP socket, the tunnel registries (keyed by
//! remote address and by tunnel ID), the IP pool, and the
//! control-message dispatch. One spawned task handles each received
//! datagram, so packets for different tunnels (and out-of-order packets
//! for the same tunnel) are processed concurrently; a second background
//! task periodically evicts idle tunnels.
//!
//! # Locking
//!
//! The registries are `DashMap`s and the ID counters sit behind their
//! own mutexes; critical sections only look up and mutate, never
//! perform network I/O or call into the PPP engine. The per-tunnel
//! session map is guarded by the tunnel's own lock, independent of the
//! server-wide registries.
//!
//! # Cancellation
//!
//! The server carries the root `CancellationToken`; every tunnel
//! derives a child from it and every session a grandchild, so `stop()`
//! cancels the whole tree.

mod control;
mod ppp_bridge;
mod stats;

pub use stats::{ServerStats, StatsSnapshot};

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::pool::IpPool;
use crate::ppp::{PacketSink, PppEngine};
use crate::tunnel::{Session, Tunnel};
use crate::wire::{self, Avp, ControlMessageType, L2tpHeader, AVP_MESSAGE_TYPE};

/// Receive buffer size; a UDP datagram cannot exceed 64 KiB
const RECV_BUFFER_SIZE: usize = 65536;

/// Callback invoked with every raw IP packet extracted from a PPP frame
pub type PacketCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// An L2TP tunnel server
pub struct Server {
    config: ServerConfig,
    socket: RwLock<Option<Arc<UdpSocket>>>,

    /// Tunnels keyed by the peer's UDP address
    tunnels_by_addr: DashMap<SocketAddr, Arc<Tunnel>>,
    /// The same tunnels keyed by our tunnel ID
    tunnels_by_id: DashMap<u16, Arc<Tunnel>>,

    /// Owned by this instance; multiple servers in one process never
    /// share a counter
    next_tunnel_id: Mutex<u16>,
    next_session_id: Mutex<u16>,

    pool: Arc<IpPool>,
    engine: Arc<dyn PppEngine>,
    sink: Arc<dyn PacketSink>,
    on_packet: Option<PacketCallback>,

    stats: ServerStats,
    cancel: CancellationToken,
}

impl Server {
    /// Create a server; no socket is bound until [`Server::start`]
    #[must_use]
    pub fn new(
        config: ServerConfig,
        engine: Arc<dyn PppEngine>,
        sink: Arc<dyn PacketSink>,
    ) -> Self {
        let pool = Arc::new(IpPool::new(config.pool.start, config.pool.end));
        Self {
            config,
            socket: RwLock::new(None),
            tunnels_by_addr: DashMap::new(),
            tunnels_by_id: DashMap::new(),
            next_tunnel_id: Mutex::new(1),
            next_session_id: Mutex::new(1),
            pool,
            engine,
            sink,
            on_packet: None,
            stats: ServerStats::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Install a callback invoked with every raw IP packet extracted
    /// from a PPP frame, alongside the packet sink
    #[must_use]
    pub fn with_packet_callback(mut self, callback: PacketCallback) -> Self {
        self.on_packet = Some(callback);
        self
    }

    /// Bind the UDP socket and spawn the receive and cleanup loops
    ///
    /// Calling `start` on an already-started server is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Io` if the bind fails.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        if self.socket.read().is_some() {
            debug!("Server already started");
            return Ok(());
        }

        let socket = Arc::new(UdpSocket::bind(self.config.listen).await?);
        let local = socket.local_addr()?;
        *self.socket.write() = Some(Arc::clone(&socket));

        info!("L2TP server listening on {local}");

        let server = Arc::clone(self);
        let recv_socket = Arc::clone(&socket);
        tokio::spawn(async move {
            server.receive_loop(recv_socket).await;
        });

        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.cleanup_loop().await;
        });

        Ok(())
    }

    /// Address the socket is bound to
    ///
    /// # Errors
    ///
    /// Returns `ServerError::NotStarted` before [`Server::start`].
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        let socket = self.socket()?;
        Ok(socket.local_addr()?)
    }

    /// Stop the server: cancels both loops, closes every tunnel (which
    /// closes its sessions), and drops the socket. Idempotent.
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();

        let tunnels: Vec<_> = self
            .tunnels_by_addr
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.tunnels_by_addr.clear();
        self.tunnels_by_id.clear();
        for tunnel in tunnels {
            self.release_tunnel_addresses(&tunnel);
            tunnel.close();
        }

        *self.socket.write() = None;
        info!("L2TP server stopped");
    }

    /// Runtime statistics
    #[must_use]
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Snapshot of runtime statistics
    #[must_use]
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The server's IP pool
    #[must_use]
    pub fn pool(&self) -> &Arc<IpPool> {
        &self.pool
    }

    /// Number of live tunnels
    #[must_use]
    pub fn tunnel_count(&self) -> usize {
        self.tunnels_by_id.len()
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, ServerError> {
        self.socket
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(ServerError::NotStarted)
    }

    /// Receive datagrams and spawn one handler task per packet
    ///
    /// A read error terminates the loop (effectively stopping the
    /// server); decode errors inside handlers are per-packet only.
    async fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("Receive loop cancelled");
                    return;
                }
                result = socket.recv_from(&mut buf) => match result {
                    Ok((n, remote_addr)) => {
                        self.stats.record_datagram();
                        let server = Arc::clone(&self);
                        let data = buf[..n].to_vec();
                        tokio::spawn(async move {
                            server.handle_packet(&data, remote_addr).await;
                        });
                    }
                    Err(e) => {
                        error!("UDP read failed, stopping receive loop: {e}");
                        return;
                    }
                }
            }
        }
    }

    /// Periodically evict tunnels idle longer than the configured
    /// timeout, cascading session closure
    async fn cleanup_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval());
        // The first tick fires immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                _ = ticker.tick() => self.sweep_idle_tunnels(),
            }
        }
    }

    fn sweep_idle_tunnels(&self) {
        let idle_timeout = self.config.idle_timeout();
        let idle: Vec<SocketAddr> = self
            .tunnels_by_addr
            .iter()
            .filter(|entry| entry.value().is_idle(idle_timeout))
            .map(|entry| *entry.key())
            .collect();

        for addr in idle {
            if let Some(tunnel) = self.remove_tunnel(addr) {
                info!(tunnel_id = tunnel.id(), %addr, "Evicted idle tunnel");
            }
        }
    }

    /// Decode and dispatch one datagram
    ///
    /// Control messages go through the dispatch table; data messages go
    /// to the PPP frame bridge. All errors here are terminal for this
    /// packet only.
    pub async fn handle_packet(&self, data: &[u8], remote_addr: SocketAddr) {
        let (header, consumed) = match L2tpHeader::parse(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.record_decode_error();
                warn!(%remote_addr, "Dropping packet with bad header: {e}");
                return;
            }
        };

        let payload = &data[consumed..];
        if header.is_control() {
            self.stats.record_control();
            self.handle_control_message(&header, payload, remote_addr)
                .await;
        } else {
            self.stats.record_data();
            self.handle_data_message(&header, payload, remote_addr).await;
        }
    }

    /// Route a data message to the PPP frame bridge
    async fn handle_data_message(
        &self,
        header: &L2tpHeader,
        payload: &[u8],
        remote_addr: SocketAddr,
    ) {
        if header.session_id == 0 {
            return;
        }

        // Lookup misses are stale or duplicate traffic; UDP has no
        // connection state to reset, so drop silently.
        let Some(tunnel) = self.tunnel_by_addr(remote_addr) else {
            return;
        };
        let Some(session) = tunnel.session(header.session_id) else {
            return;
        };

        session.touch();
        tunnel.touch();

        self.handle_ppp_frame(&tunnel, &session, payload).await;
    }

    /// Serialize and send a control message on `tunnel`
    ///
    /// The MessageType AVP is prepended, the header length field is
    /// patched once the total size is known, and Ns/Nr come from the
    /// tunnel's counters.
    pub(crate) async fn send_control_message(
        &self,
        tunnel: &Tunnel,
        session_id: u16,
        message_type: ControlMessageType,
        extra_avps: Vec<Avp>,
    ) -> Result<(), ServerError> {
        let socket = self.socket()?;

        let header = L2tpHeader::control(
            tunnel.peer_id(),
            session_id,
            tunnel.next_ns(),
            tunnel.nr(),
        );

        let mut avps = vec![Avp::u16_avp(AVP_MESSAGE_TYPE, message_type.as_u16(), true)];
        avps.extend(extra_avps);

        let mut packet = header.serialize();
        packet.extend_from_slice(&wire::serialize_avps(&avps));
        wire::patch_length(&mut packet);

        socket.send_to(&packet, tunnel.remote_addr()).await?;

        debug!(
            message_type = message_type.as_u16(),
            remote_addr = %tunnel.remote_addr(),
            ns = header.ns,
            nr = header.nr,
            "Sent control message"
        );
        Ok(())
    }

    /// Send a PPP frame to the peer as an L2TP data message
    pub(crate) async fn send_data_message(
        &self,
        tunnel: &Tunnel,
        session: &Session,
        ppp_frame: &[u8],
    ) -> Result<(), ServerError> {
        let socket = self.socket()?;

        let header = L2tpHeader::data(tunnel.peer_id(), session.peer_id());
        let mut packet = header.serialize();
        packet.extend_from_slice(ppp_frame);

        socket.send_to(&packet, tunnel.remote_addr()).await?;

        debug!(
            session_id = session.id(),
            len = ppp_frame.len(),
            "Sent PPP frame"
        );
        Ok(())
    }

    /// Send a PPP frame to a specific session, for manual control
    ///
    /// # Errors
    ///
    /// Returns a lookup error if the tunnel or session does not exist.
    pub async fn send_ppp_frame(
        &self,
        tunnel_id: u16,
        session_id: u16,
        ppp_frame: &[u8],
    ) -> Result<(), ServerError> {
        let tunnel = self
            .tunnels_by_id
            .get(&tunnel_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ServerError::TunnelNotFound(tunnel_id))?;
        let session = tunnel
            .session(session_id)
            .ok_or(ServerError::SessionNotFound(session_id, tunnel_id))?;

        self.send_data_message(&tunnel, &session, ppp_frame).await
    }

    /// Allocate a tunnel ID: wraps skipping 0 and re-checks the by-ID
    /// registry, so concurrent allocations never collide until the ID
    /// space wraps
    pub(crate) fn allocate_tunnel_id(&self) -> u16 {
        let mut next = self.next_tunnel_id.lock();
        loop {
            let id = *next;
            *next = next.wrapping_add(1);
            if *next == 0 {
                *next = 1;
            }
            if id != 0 && !self.tunnels_by_id.contains_key(&id) {
                return id;
            }
        }
    }

    /// Allocate a session ID: a plain wrapping counter
    ///
    /// Sessions are tunnel-scoped, so collisions across tunnels are
    /// harmless; the counter is shared server-wide and never reused
    /// faster than it wraps.
    pub(crate) fn allocate_session_id(&self) -> u16 {
        let mut next = self.next_session_id.lock();
        let id = *next;
        *next = next.wrapping_add(1);
        if *next == 0 {
            *next = 1;
        }
        id
    }

    /// Look up the tunnel for a peer address
    #[must_use]
    pub fn tunnel_by_addr(&self, addr: SocketAddr) -> Option<Arc<Tunnel>> {
        self.tunnels_by_addr
            .get(&addr)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Register a tunnel under both keys; an existing tunnel for the
    /// same address is closed and replaced (last writer wins)
    pub(crate) fn register_tunnel(&self, addr: SocketAddr, tunnel: Arc<Tunnel>) {
        if let Some(old) = self.tunnels_by_addr.insert(addr, Arc::clone(&tunnel)) {
            self.tunnels_by_id.remove(&old.id());
            self.release_tunnel_addresses(&old);
            old.close();
            debug!(
                old_tunnel_id = old.id(),
                new_tunnel_id = tunnel.id(),
                "Replaced existing tunnel for address"
            );
        }
        self.tunnels_by_id.insert(tunnel.id(), tunnel);
        self.stats.record_tunnel_created();
    }

    /// Remove and close a tunnel, releasing its sessions' pool
    /// addresses
    pub(crate) fn remove_tunnel(&self, addr: SocketAddr) -> Option<Arc<Tunnel>> {
        let (_, tunnel) = self.tunnels_by_addr.remove(&addr)?;
        self.tunnels_by_id.remove(&tunnel.id());
        self.release_tunnel_addresses(&tunnel);
        tunnel.close();
        debug!(tunnel_id = tunnel.id(), "Removed tunnel");
        Some(tunnel)
    }

    fn release_tunnel_addresses(&self, tunnel: &Tunnel) {
        for session in tunnel.sessions() {
            self.pool.release(&session.pool_key());
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
