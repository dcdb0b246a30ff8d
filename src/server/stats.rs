//! Server runtime counters
//!
//! Plain relaxed atomics; counters are monotonic and only ever read as
//! a point-in-time snapshot for logging.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters maintained by the server's receive path
#[derive(Debug, Default)]
pub struct ServerStats {
    datagrams_received: AtomicU64,
    control_messages: AtomicU64,
    data_messages: AtomicU64,
    decode_errors: AtomicU64,
    tunnels_created: AtomicU64,
    sessions_created: AtomicU64,
}

/// A point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub datagrams_received: u64,
    pub control_messages: u64,
    pub data_messages: u64,
    pub decode_errors: u64,
    pub tunnels_created: u64,
    pub sessions_created: u64,
}

impl ServerStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_datagram(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_control(&self) {
        self.control_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_data(&self) {
        self.data_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tunnel_created(&self) {
        self.tunnels_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy all counters at once
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            control_messages: self.control_messages.load(Ordering::Relaxed),
            data_messages: self.data_messages.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            tunnels_created: self.tunnels_created.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = ServerStats::new();
        stats.record_datagram();
        stats.record_datagram();
        stats.record_control();
        stats.record_decode_error();
        stats.record_tunnel_created();
        stats.record_session_created();

        let snap = stats.snapshot();
        assert_eq!(snap.datagrams_received, 2);
        assert_eq!(snap.control_messages, 1);
        assert_eq!(snap.data_messages, 0);
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.tunnels_created, 1);
        assert_eq!(snap.sessions_created, 1);
    }
}
