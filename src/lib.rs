//! rust-l2tp: L2TPv2 tunnel endpoint
//!
//! This crate implements an L2TPv2 (RFC 2661) server and companion
//! client over UDP. The server negotiates control connections
//! ("tunnels") and calls ("sessions"), bridges the PPP payloads
//! carried in data messages to a pluggable negotiation engine, and
//! forwards user IPv4 traffic to a packet sink.
//!
//! # Features
//!
//! - **Control protocol**: SCCRQ/SCCRP/SCCCN, ICRQ/ICRP/ICCN,
//!   StopCCN, CDN and Hello handling with lenient sequence tracking
//! - **PPP bridge**: LCP, PAP, CHAP and IPCP delegation with
//!   push-driven IP assignment from a configurable pool
//! - **Client**: the mirror-image handshake plus packet injection,
//!   for testing and outbound tunneling
//! - **Concurrency**: one task per datagram, hierarchical
//!   cancellation, periodic idle-tunnel cleanup
//!
//! # Architecture
//!
//! ```text
//! Peer → UDP 1701 → Server receive loop → per-packet task
//!                        ↓ control               ↓ data
//!                  dispatch table          PPP frame bridge
//!                        ↓                   ↓          ↓
//!                 tunnel/session      PPP engine   packet sink
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rust_l2tp::config::ServerConfig;
//! use rust_l2tp::ppp::{ChannelPacketSink, DefaultPppEngine};
//! use rust_l2tp::server::Server;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, mut packets) = ChannelPacketSink::new(256);
//! let server = Arc::new(Server::new(
//!     ServerConfig::default(),
//!     Arc::new(DefaultPppEngine::accept_all()),
//!     Arc::new(sink),
//! ));
//! server.start().await?;
//!
//! while let Some(packet) = packets.recv().await {
//!     // forward packet.payload to the network stack
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`client`]: Client-side handshake and packet injection
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`pool`]: IP address pool
//! - [`ppp`]: PPP framing and the engine/sink interfaces
//! - [`server`]: Server, dispatch and the PPP bridge
//! - [`tunnel`]: Tunnel and session state
//! - [`wire`]: L2TP header and AVP codec

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod client;
pub mod config;
pub mod error;
pub mod pool;
pub mod ppp;
pub mod server;
pub mod tunnel;
pub mod wire;

// Re-export commonly used types at the crate root
pub use client::{Client, ClientHooks};
pub use config::{ClientConfig, Config, LogConfig, PoolConfig, ServerConfig};
pub use error::{ClientError, CodecError, ConfigError, L2tpError, PoolError, PppError, ServerError};
pub use pool::IpPool;
pub use ppp::{ChannelPacketSink, DefaultPppEngine, InboundPacket, PacketSink, PppEngine};
pub use server::{Server, ServerStats, StatsSnapshot};
pub use tunnel::{Session, SessionState, Tunnel, TunnelState};
pub use wire::{Avp, ControlMessageType, L2tpHeader};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
