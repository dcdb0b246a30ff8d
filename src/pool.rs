//! IP address pool
//!
//! Allocates client addresses for authenticated sessions. An address is
//! in exactly one of two places at any time: the `available` list or
//! the `allocated` map keyed by session key.
//!
//! Allocation picks uniformly at random from the available set, so
//! allocation order is unspecified. This is a documented
//! non-determinism, not a bug; callers must not rely on selection
//! order.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use crate::error::PoolError;

/// Default pool range start (172.16.0.2; .1 is reserved for the server)
pub const DEFAULT_POOL_START: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 2);
/// Default pool range end
pub const DEFAULT_POOL_END: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 254);

struct PoolState {
    available: Vec<Ipv4Addr>,
    allocated: HashMap<String, Ipv4Addr>,
}

/// Thread-safe IP address pool keyed by session key
pub struct IpPool {
    state: Mutex<PoolState>,
}

impl IpPool {
    /// Create a pool covering the inclusive range `start..=end`
    ///
    /// An inverted range yields an empty pool; allocation then fails
    /// with [`PoolError::Exhausted`].
    #[must_use]
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        let start = u32::from(start);
        let end = u32::from(end);
        let available = (start..=end).map(Ipv4Addr::from).collect();

        Self {
            state: Mutex::new(PoolState {
                available,
                allocated: HashMap::new(),
            }),
        }
    }

    /// Allocate an address for `session_key`
    ///
    /// The address is picked uniformly at random from the available
    /// set and moved to the allocated map.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Exhausted`] when no addresses remain.
    pub fn allocate(&self, session_key: &str) -> Result<Ipv4Addr, PoolError> {
        let mut state = self.state.lock();
        if state.available.is_empty() {
            return Err(PoolError::Exhausted);
        }

        let idx = rand::thread_rng().gen_range(0..state.available.len());
        let ip = state.available.swap_remove(idx);
        state.allocated.insert(session_key.to_string(), ip);

        debug!(%ip, session_key, "Allocated pool address");
        Ok(ip)
    }

    /// Release the address held by `session_key`, if any
    ///
    /// The address returns to the available set. Releasing an unknown
    /// key is a no-op.
    pub fn release(&self, session_key: &str) {
        let mut state = self.state.lock();
        if let Some(ip) = state.allocated.remove(session_key) {
            state.available.push(ip);
            debug!(%ip, session_key, "Released pool address");
        }
    }

    /// Address currently held by `session_key`, if any
    #[must_use]
    pub fn allocation(&self, session_key: &str) -> Option<Ipv4Addr> {
        self.state.lock().allocated.get(session_key).copied()
    }

    /// Number of allocated addresses
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.state.lock().allocated.len()
    }

    /// Number of available addresses
    #[must_use]
    pub fn available_count(&self) -> usize {
        self.state.lock().available.len()
    }
}

impl Default for IpPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_START, DEFAULT_POOL_END)
    }
}
