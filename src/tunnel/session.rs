//! Per-call session state
//!
//! A session is one logical PPP call multiplexed inside a tunnel. It is
//! created on ICRQ receipt (server side) and destroyed on CDN or when
//! its owning tunnel closes; a session never outlives its tunnel.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::Instant;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Tunnel;

/// Session call states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Client only: ICRQ sent, waiting for ICRP
    AwaitingIcrp,
    /// Server: session created on ICRQ, ICRP sent
    Created,
    /// ICCN received; eligible for PPP and authentication traffic
    Established,
    /// An authentication exchange is in flight
    Authenticating,
    /// Authentication verdict: accepted
    Authenticated,
    /// Authentication verdict: rejected; session stays open until CDN
    /// or timeout
    AuthFailed,
    /// Torn down
    Closed,
}

/// Per-call state within a tunnel
pub struct Session {
    /// Our session ID
    id: u16,
    /// Peer's session ID (from the ICRQ/ICRP AssignedSessionID AVP)
    peer_id: u16,
    /// Non-owning back-reference to the owning tunnel
    tunnel: Weak<Tunnel>,
    state: Mutex<SessionState>,
    authenticated: AtomicBool,
    client_ip: Mutex<Option<Ipv4Addr>>,
    server_ip: Mutex<Option<Ipv4Addr>>,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session inside `tunnel` with the given local and peer IDs
    ///
    /// The cancellation token is derived from the tunnel's, so closing
    /// the tunnel cancels every session it owns.
    #[must_use]
    pub fn new(id: u16, peer_id: u16, tunnel: &std::sync::Arc<Tunnel>) -> Self {
        Self {
            id,
            peer_id,
            tunnel: std::sync::Arc::downgrade(tunnel),
            state: Mutex::new(SessionState::Created),
            authenticated: AtomicBool::new(false),
            client_ip: Mutex::new(None),
            server_ip: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            cancel: tunnel.cancellation_token().child_token(),
        }
    }

    /// Our session ID
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The peer's session ID
    #[must_use]
    pub fn peer_id(&self) -> u16 {
        self.peer_id
    }

    /// The owning tunnel, if it is still alive
    #[must_use]
    pub fn tunnel(&self) -> Option<std::sync::Arc<Tunnel>> {
        self.tunnel.upgrade()
    }

    /// Current call state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Transition to a new call state
    pub fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// Whether the session passed authentication
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    /// Record an authentication verdict
    ///
    /// Failure is a state transition, not an error: the session stays
    /// open until disconnected by CDN or idle timeout.
    pub fn set_authenticated(&self, ok: bool) {
        self.authenticated.store(ok, Ordering::Relaxed);
        self.set_state(if ok {
            SessionState::Authenticated
        } else {
            SessionState::AuthFailed
        });
    }

    /// IP assigned to the peer, if any
    #[must_use]
    pub fn client_ip(&self) -> Option<Ipv4Addr> {
        *self.client_ip.lock()
    }

    /// Record the IP assigned to the peer
    pub fn set_client_ip(&self, ip: Ipv4Addr) {
        *self.client_ip.lock() = Some(ip);
    }

    /// Our side's IP for this call, if any
    #[must_use]
    pub fn server_ip(&self) -> Option<Ipv4Addr> {
        *self.server_ip.lock()
    }

    /// Record our side's IP for this call
    pub fn set_server_ip(&self, ip: Ipv4Addr) {
        *self.server_ip.lock() = Some(ip);
    }

    /// Refresh the last-activity timestamp
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Key under which this session's IP pool allocation is tracked
    #[must_use]
    pub fn pool_key(&self) -> String {
        let tunnel_id = self.tunnel.upgrade().map_or(0, |t| t.id());
        format!("{}-{}", tunnel_id, self.id)
    }

    /// Cancellation token scoped to this session
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Close the session: transitions to `Closed` and cancels the
    /// session token. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Closed {
            return;
        }
        *state = SessionState::Closed;
        drop(state);
        self.cancel.cancel();
        debug!(session_id = self.id, "Session closed");
    }
}
