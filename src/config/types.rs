//! Configuration types for rust-l2tp
//!
//! This module defines the configuration structures for the server
//! binary and the embeddable client. Configuration is loaded from JSON
//! files and can be validated at startup.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pool::{DEFAULT_POOL_END, DEFAULT_POOL_START};

/// Default L2TP port (RFC 2661)
pub const DEFAULT_L2TP_PORT: u16 = 1701;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            server: ServerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// L2TP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// UDP listen address
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Host Name AVP sent in SCCRP
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Vendor Name AVP sent in SCCRP
    #[serde(default = "default_vendor")]
    pub vendor_name: String,

    /// Receive Window Size AVP advertised in SCCRP (advisory; accepted
    /// from peers but not enforced)
    #[serde(default = "default_receive_window")]
    pub receive_window: u16,

    /// Tunnels idle longer than this are evicted
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How often the idle-tunnel sweep runs
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// IP pool for authenticated sessions
    #[serde(default)]
    pub pool: PoolConfig,
}

impl ServerConfig {
    /// Idle timeout as a `Duration`
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Cleanup interval as a `Duration`
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Validate the server configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.is_empty() {
            return Err(ConfigError::ValidationError("hostname is empty".into()));
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "idle_timeout_secs must be positive".into(),
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "cleanup_interval_secs must be positive".into(),
            ));
        }
        self.pool.validate()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            hostname: default_hostname(),
            vendor_name: default_vendor(),
            receive_window: default_receive_window(),
            idle_timeout_secs: default_idle_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
            pool: PoolConfig::default(),
        }
    }
}

/// IP pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// First address of the pool range (inclusive)
    pub start: Ipv4Addr,
    /// Last address of the pool range (inclusive)
    pub end: Ipv4Addr,
    /// Our side's address, proposed to peers during IPCP
    pub server_ip: Ipv4Addr,
}

impl PoolConfig {
    /// Validate the pool range
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the range is inverted
    /// or contains the server address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if u32::from(self.start) > u32::from(self.end) {
            return Err(ConfigError::ValidationError(format!(
                "pool range is inverted: {} > {}",
                self.start, self.end
            )));
        }
        let server = u32::from(self.server_ip);
        if server >= u32::from(self.start) && server <= u32::from(self.end) {
            return Err(ConfigError::ValidationError(format!(
                "server_ip {} falls inside the pool range",
                self.server_ip
            )));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            start: DEFAULT_POOL_START,
            end: DEFAULT_POOL_END,
            server_ip: Ipv4Addr::new(172, 16, 0, 1),
        }
    }
}

/// L2TP client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// PAP username; authentication is skipped when credentials are
    /// absent
    #[serde(default)]
    pub username: Option<String>,

    /// PAP password
    #[serde(default)]
    pub password: Option<String>,

    /// Host Name AVP sent in SCCRQ
    #[serde(default = "default_client_hostname")]
    pub hostname: String,

    /// Read deadline for each handshake step
    #[serde(default = "default_handshake_timeout")]
    pub timeout_secs: u64,

    /// Local tunnel ID; random non-zero when unset
    #[serde(default)]
    pub tunnel_id: Option<u16>,

    /// Local session ID
    #[serde(default = "default_client_session_id")]
    pub session_id: u16,
}

impl ClientConfig {
    /// Handshake timeout as a `Duration`
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate the client configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on reserved IDs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnel_id == Some(0) {
            return Err(ConfigError::ValidationError(
                "tunnel_id 0 is reserved".into(),
            ));
        }
        if self.session_id == 0 {
            return Err(ConfigError::ValidationError(
                "session_id 0 is reserved".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            hostname: default_client_hostname(),
            timeout_secs: default_handshake_timeout(),
            tunnel_id: None,
            session_id: default_client_session_id(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include the event target in output
    #[serde(default)]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_L2TP_PORT))
}

fn default_hostname() -> String {
    "rust-l2tp".into()
}

fn default_vendor() -> String {
    "rust-l2tp".into()
}

fn default_receive_window() -> u16 {
    4
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    30
}

fn default_client_hostname() -> String {
    "rust-l2tp-client".into()
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_client_session_id() -> u16 {
    100
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
