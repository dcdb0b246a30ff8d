//! Error types for rust-l2tp
//!
//! This module defines the error hierarchy for the L2TP endpoint.
//! Errors are categorized by subsystem: wire decoding, IP pool,
//! PPP framing, server, client, and configuration.
//!
//! Decode errors are always local and non-fatal: the offending packet
//! is dropped and logged, and the endpoint keeps serving other packets.

use std::io;

use thiserror::Error;

/// Top-level error type for rust-l2tp
#[derive(Debug, Error)]
pub enum L2tpError {
    /// Wire format decoding errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// IP pool errors
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// PPP framing errors
    #[error("PPP error: {0}")]
    Ppp(#[from] PppError),

    /// Server errors
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// Client errors
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors produced by the L2TP wire codec
///
/// All codec errors are terminal for the packet being decoded and
/// never fatal for the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Fewer bytes than the header (or a flagged optional field) requires
    #[error("Truncated L2TP header: need {need} bytes, have {have}")]
    TruncatedHeader { need: usize, have: usize },

    /// AVP declared length below the minimum header size
    #[error("AVP too short: declared length {declared}, minimum {minimum}")]
    AvpTooShort { declared: usize, minimum: usize },

    /// AVP declared length exceeds the remaining buffer
    #[error("AVP overruns buffer: declared length {declared}, {remaining} bytes remaining")]
    AvpOverrun { declared: usize, remaining: usize },

    /// AVP value smaller than the width requested by an accessor
    #[error("AVP value too short: need {need} bytes, have {have}")]
    ValueTooShort { need: usize, have: usize },
}

/// IP pool allocation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// No addresses left in the pool
    #[error("No available IP addresses in pool")]
    Exhausted,
}

/// PPP frame handling errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PppError {
    /// Frame shorter than the PPP protocol field
    #[error("PPP frame too short: {len} bytes")]
    FrameTooShort { len: usize },

    /// Control-protocol packet (LCP/PAP/CHAP/IPCP) shorter than its
    /// declared or minimum length
    #[error("PPP control packet truncated: {reason}")]
    PacketTruncated { reason: &'static str },
}

/// Server-side errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Server has not been started (no bound socket)
    #[error("Server not started")]
    NotStarted,

    /// No tunnel registered under the given ID
    #[error("Tunnel {0} not found")]
    TunnelNotFound(u16),

    /// No session registered under the given ID
    #[error("Session {0} not found in tunnel {1}")]
    SessionNotFound(u16, u16),

    /// Wire codec failure while building an outbound message
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Socket bind/read/write failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Client-side errors
///
/// Handshake errors are hard failures: the caller must discard the
/// client and create a new one.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A handshake read deadline expired
    #[error("Timed out waiting for {expecting}")]
    Timeout { expecting: &'static str },

    /// The peer answered with a different control message than expected
    #[error("Expected {expected} ({expected_code}), got message type {got}")]
    UnexpectedMessage {
        expected: &'static str,
        expected_code: u16,
        got: u16,
    },

    /// The peer answered with a data message mid-handshake
    #[error("Expected control message, got data message")]
    NotControl,

    /// Operation requires an established session
    #[error("Session not established")]
    NotEstablished,

    /// Malformed response during the handshake
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, inverted ranges)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    Io(#[from] io::Error),
}
