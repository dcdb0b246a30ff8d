//! Tunnel and session state
//!
//! A tunnel is one L2TP control connection between two peers; it owns a
//! registry of sessions keyed by session ID and the per-tunnel Ns/Nr
//! sequence counters.
//!
//! # Sequence discipline
//!
//! [`Tunnel::validate_sequence`] is intentionally lenient: a matching Ns
//! advances Nr normally, and on any mismatch Nr is force-set to the
//! received Ns + 1 with a warning. Messages are always accepted; there
//! is no out-of-order buffering or retransmission request. Altering
//! this changes interoperability with existing peers.
//!
//! # Locking
//!
//! Each piece of tunnel state sits behind its own small
//! `parking_lot::Mutex`, independent of the server-wide registry lock.
//! No lock is ever held across I/O, so two control messages for the
//! same tunnel can be processed in parallel without serializing
//! unrelated tunnels.

mod session;

pub use session::{Session, SessionState};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Tunnel control-connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Client only: SCCRQ sent, waiting for SCCRP
    AwaitingSccrp,
    /// Server: SCCRP sent, waiting for SCCCN
    AwaitingScccn,
    /// Control connection up
    Established,
    /// Torn down
    Stopped,
}

/// Ns/Nr counters, kept together under one lock
#[derive(Debug, Default)]
struct SequenceState {
    ns: u16,
    nr: u16,
}

/// Per-control-connection state
pub struct Tunnel {
    /// Our tunnel ID, allocated by the server; never 0
    id: u16,
    /// Peer's tunnel ID, learned from SCCRQ/SCCRP
    peer_id: u16,
    /// Peer's UDP address
    remote_addr: SocketAddr,
    state: Mutex<TunnelState>,
    seq: Mutex<SequenceState>,
    sessions: Mutex<HashMap<u16, Arc<Session>>>,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
}

impl Tunnel {
    /// Create a tunnel with a cancellation token derived from `parent`
    /// (the server's root token)
    #[must_use]
    pub fn new(id: u16, peer_id: u16, remote_addr: SocketAddr, parent: &CancellationToken) -> Self {
        Self {
            id,
            peer_id,
            remote_addr,
            state: Mutex::new(TunnelState::AwaitingScccn),
            seq: Mutex::new(SequenceState::default()),
            sessions: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
            cancel: parent.child_token(),
        }
    }

    /// Our tunnel ID
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The peer's tunnel ID
    #[must_use]
    pub fn peer_id(&self) -> u16 {
        self.peer_id
    }

    /// The peer's UDP address
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Current control-connection state
    #[must_use]
    pub fn state(&self) -> TunnelState {
        *self.state.lock()
    }

    /// Transition to a new control-connection state
    pub fn set_state(&self, state: TunnelState) {
        *self.state.lock() = state;
    }

    /// Return the current Ns, then increment it
    ///
    /// Used for every outbound control message on this tunnel.
    pub fn next_ns(&self) -> u16 {
        let mut seq = self.seq.lock();
        let ns = seq.ns;
        seq.ns = seq.ns.wrapping_add(1);
        ns
    }

    /// Current Nr (next expected peer Ns)
    #[must_use]
    pub fn nr(&self) -> u16 {
        self.seq.lock().nr
    }

    /// Validate a received Ns, leniently
    ///
    /// A matching Ns advances Nr; any mismatch logs a warning and
    /// force-sets `nr = received_ns + 1`. The message is accepted either
    /// way.
    pub fn validate_sequence(&self, received_ns: u16) {
        let mut seq = self.seq.lock();
        if received_ns == seq.nr {
            seq.nr = seq.nr.wrapping_add(1);
        } else {
            warn!(
                tunnel_id = self.id,
                expected = seq.nr,
                received = received_ns,
                "Out-of-sequence control message, resynchronizing"
            );
            seq.nr = received_ns.wrapping_add(1);
        }
    }

    /// Register a session under its local ID
    pub fn add_session(&self, session: Arc<Session>) {
        self.sessions.lock().insert(session.id(), session);
    }

    /// Look up a session by local ID
    #[must_use]
    pub fn session(&self, session_id: u16) -> Option<Arc<Session>> {
        self.sessions.lock().get(&session_id).cloned()
    }

    /// Remove and close a session; returns it if it existed
    pub fn remove_session(&self, session_id: u16) -> Option<Arc<Session>> {
        let session = self.sessions.lock().remove(&session_id);
        if let Some(ref s) = session {
            s.close();
            debug!(
                tunnel_id = self.id,
                session_id, "Removed session from tunnel"
            );
        }
        session
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Snapshot of all live sessions
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Refresh the last-activity timestamp
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Whether the tunnel has been inactive for longer than `timeout`
    #[must_use]
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.lock().elapsed() > timeout
    }

    /// Cancellation token scoped to this tunnel
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Close the tunnel: closes and drops every session, transitions to
    /// `Stopped`, cancels the tunnel token. Idempotent and safe to call
    /// twice concurrently.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == TunnelState::Stopped {
                return;
            }
            *state = TunnelState::Stopped;
        }

        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.close();
        }
        self.cancel.cancel();
        debug!(
            tunnel_id = self.id,
            closed_sessions = sessions.len(),
            "Tunnel closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tunnel() -> Arc<Tunnel> {
        Arc::new(Tunnel::new(
            9,
            17,
            "10.0.0.1:1701".parse().unwrap(),
            &CancellationToken::new(),
        ))
    }

    #[test]
    fn test_next_ns_post_increments() {
        let tunnel = test_tunnel();
        assert_eq!(tunnel.next_ns(), 0);
        assert_eq!(tunnel.next_ns(), 1);
        assert_eq!(tunnel.next_ns(), 2);
    }

    #[test]
    fn test_lenient_sequence_validation() {
        let tunnel = test_tunnel();

        // In-order Ns values advance Nr normally.
        for expected in 0..5 {
            assert_eq!(tunnel.nr(), expected);
            tunnel.validate_sequence(expected);
        }
        assert_eq!(tunnel.nr(), 5);

        // Matching Ns increments.
        tunnel.validate_sequence(5);
        assert_eq!(tunnel.nr(), 6);

        // A wildly out-of-sequence Ns is still accepted and resyncs Nr.
        tunnel.validate_sequence(99);
        assert_eq!(tunnel.nr(), 100);
    }

    #[test]
    fn test_sequence_wraps() {
        let tunnel = test_tunnel();
        tunnel.validate_sequence(u16::MAX);
        assert_eq!(tunnel.nr(), 0);
    }

    #[test]
    fn test_cascade_close() {
        let tunnel = test_tunnel();
        let sessions: Vec<_> = (1..=4)
            .map(|id| Arc::new(Session::new(id, id + 100, &tunnel)))
            .collect();
        for session in &sessions {
            tunnel.add_session(Arc::clone(session));
        }
        assert_eq!(tunnel.session_count(), 4);

        tunnel.close();

        assert_eq!(tunnel.state(), TunnelState::Stopped);
        assert_eq!(tunnel.session_count(), 0);
        for session in &sessions {
            assert_eq!(session.state(), SessionState::Closed);
            assert!(session.cancellation_token().is_cancelled());
        }
    }

    #[test]
    fn test_close_idempotent() {
        let tunnel = test_tunnel();
        tunnel.close();
        tunnel.close();
        assert_eq!(tunnel.state(), TunnelState::Stopped);
    }

    #[test]
    fn test_cancellation_propagates_from_parent() {
        let parent = CancellationToken::new();
        let tunnel = Arc::new(Tunnel::new(
            1,
            1,
            "10.0.0.1:1701".parse().unwrap(),
            &parent,
        ));
        let session = Session::new(1, 1, &tunnel);

        parent.cancel();
        assert!(tunnel.cancellation_token().is_cancelled());
        assert!(session.cancellation_token().is_cancelled());
    }

    #[test]
    fn test_idle_detection() {
        let tunnel = test_tunnel();
        assert!(!tunnel.is_idle(Duration::from_secs(60)));
        assert!(tunnel.is_idle(Duration::ZERO));

        std::thread::sleep(Duration::from_millis(5));
        tunnel.touch();
        assert!(!tunnel.is_idle(Duration::from_millis(4)));
    }

    #[test]
    fn test_session_registry() {
        let tunnel = test_tunnel();
        let session = Arc::new(Session::new(3, 50, &tunnel));
        tunnel.add_session(Arc::clone(&session));

        assert!(tunnel.session(3).is_some());
        assert!(tunnel.session(4).is_none());

        let removed = tunnel.remove_session(3).unwrap();
        assert_eq!(removed.id(), 3);
        assert_eq!(removed.state(), SessionState::Closed);
        assert!(tunnel.session(3).is_none());
        assert!(tunnel.remove_session(3).is_none());
    }
}
