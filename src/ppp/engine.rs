//! PPP negotiation engine and packet sink interfaces
//!
//! The L2TP core treats PPP option negotiation and authentication as an
//! external collaborator behind the [`PppEngine`] trait: the bridge
//! hands it every non-IPv4 PPP frame and transmits whatever response it
//! returns. Authentication verdicts arrive asynchronously through a
//! result channel polled non-blockingly after each call.
//!
//! [`DefaultPppEngine`] is the stock implementation: LCP and IPCP
//! Configure-Requests are acknowledged, PAP requests are verified
//! against a pluggable credential check, and CHAP responses are
//! accepted.
//!
//! IPv4 payloads never reach the engine; they go to a [`PacketSink`].

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::frame::{
    self, CpPacket, CHAP_RESPONSE, CP_CONFIGURE_ACK, CP_CONFIGURE_NAK, CP_CONFIGURE_REJECT,
    CP_CONFIGURE_REQUEST, PAP_AUTH_ACK, PAP_AUTH_NAK, PAP_AUTH_REQUEST, PROTO_CHAP, PROTO_IPCP,
    PROTO_LCP, PROTO_PAP,
};
use crate::error::PppError;

/// A PPP response the engine wants transmitted back to the peer
///
/// `payload` is the information field; the bridge wraps it in PPP
/// framing before sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PppResponse {
    pub protocol: u16,
    pub payload: Bytes,
}

/// PPP option negotiation and authentication engine
///
/// Implementations must be cheap to call from concurrent per-packet
/// tasks; no call here may block.
pub trait PppEngine: Send + Sync {
    /// Process one non-IPv4 PPP frame; an `Ok(Some(_))` response is
    /// re-framed and transmitted as an L2TP data message
    fn process_frame(&self, protocol: u16, payload: &[u8])
        -> Result<Option<PppResponse>, PppError>;

    /// Non-blocking check of the authentication result channel
    ///
    /// `Some(true)` marks the session authenticated, `Some(false)`
    /// marks it failed; `None` means no verdict is pending.
    fn try_auth_result(&self) -> Option<bool>;
}

/// Sink for IP packets extracted from PPP frames
///
/// Fire-and-forget: the bridge never consults a return value.
pub trait PacketSink: Send + Sync {
    fn inject_inbound(&self, protocol: u16, packet: &[u8]);
}

/// An IP packet delivered through a [`ChannelPacketSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// PPP protocol number the packet arrived under (0x0021 for IPv4)
    pub protocol: u16,
    pub payload: BytesMut,
}

/// Stock [`PacketSink`] backed by a bounded channel
///
/// Useful for wiring the endpoint to a userspace network stack or for
/// tests. Packets are dropped with a warning when the channel is full;
/// the data path never blocks on a slow consumer.
pub struct ChannelPacketSink {
    tx: mpsc::Sender<InboundPacket>,
}

impl ChannelPacketSink {
    /// Create a sink and the receiver draining it
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InboundPacket>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl PacketSink for ChannelPacketSink {
    fn inject_inbound(&self, protocol: u16, packet: &[u8]) {
        let inbound = InboundPacket {
            protocol,
            payload: BytesMut::from(packet),
        };
        if let Err(e) = self.tx.try_send(inbound) {
            warn!("Dropping inbound packet: {e}");
        }
    }
}

/// Credential check used by [`DefaultPppEngine`] for PAP
pub type AuthFn = dyn Fn(&str, &str) -> bool + Send + Sync;

/// Stock PPP engine
///
/// Handles the negotiation subset the original endpoint needs: LCP and
/// IPCP Configure-Request acknowledgement, PAP verification, and CHAP
/// acceptance. Verdicts are queued internally and drained by
/// [`PppEngine::try_auth_result`].
pub struct DefaultPppEngine {
    auth: Box<AuthFn>,
    verdict_tx: mpsc::UnboundedSender<bool>,
    verdict_rx: Mutex<mpsc::UnboundedReceiver<bool>>,
}

impl DefaultPppEngine {
    /// Engine with a custom credential check
    #[must_use]
    pub fn new(auth: Box<AuthFn>) -> Self {
        let (verdict_tx, verdict_rx) = mpsc::unbounded_channel();
        Self {
            auth,
            verdict_tx,
            verdict_rx: Mutex::new(verdict_rx),
        }
    }

    /// Engine that accepts any credentials, logging each request
    #[must_use]
    pub fn accept_all() -> Self {
        Self::new(Box::new(|username, _| {
            info!(username, "Auth request accepted (no credential check configured)");
            true
        }))
    }

    fn handle_lcp(&self, packet: &CpPacket) -> Option<PppResponse> {
        match packet.code {
            CP_CONFIGURE_REQUEST => {
                // Acknowledge whatever options the peer proposed.
                let ack = CpPacket {
                    code: CP_CONFIGURE_ACK,
                    identifier: packet.identifier,
                    data: packet.data.clone(),
                };
                Some(PppResponse {
                    protocol: PROTO_LCP,
                    payload: ack.encode().freeze(),
                })
            }
            CP_CONFIGURE_ACK => {
                debug!("LCP Configure-Ack received");
                None
            }
            CP_CONFIGURE_NAK | CP_CONFIGURE_REJECT => {
                warn!(code = packet.code, "LCP configuration rejected by peer");
                None
            }
            code => {
                debug!(code, "Unhandled LCP code");
                None
            }
        }
    }

    fn handle_pap(&self, packet: &CpPacket) -> Result<Option<PppResponse>, PppError> {
        if packet.code != PAP_AUTH_REQUEST {
            debug!(code = packet.code, "PAP packet is not a request");
            return Ok(None);
        }

        let creds = frame::parse_pap_request(&packet.data)?;
        let ok = (self.auth)(&creds.username, &creds.password);

        let (code, message) = if ok {
            info!(username = %creds.username, "PAP authentication successful");
            (PAP_AUTH_ACK, "Authentication successful")
        } else {
            warn!(username = %creds.username, "PAP authentication failed");
            (PAP_AUTH_NAK, "Authentication failed")
        };
        let _ = self.verdict_tx.send(ok);

        let reply = frame::build_pap_reply(code, packet.identifier, message);
        Ok(Some(PppResponse {
            protocol: PROTO_PAP,
            payload: reply.encode().freeze(),
        }))
    }

    fn handle_chap(&self, packet: &CpPacket) -> Option<PppResponse> {
        if packet.code != CHAP_RESPONSE {
            debug!(code = packet.code, "Unhandled CHAP code");
            return None;
        }

        // TODO: validate the response digest against the issued
        // challenge instead of accepting unconditionally.
        info!("CHAP response received, accepting");
        let _ = self.verdict_tx.send(true);

        let success = frame::build_chap_success(packet.identifier, "Authentication successful");
        Some(PppResponse {
            protocol: PROTO_CHAP,
            payload: success.encode().freeze(),
        })
    }

    fn handle_ipcp(&self, packet: &CpPacket) -> Option<PppResponse> {
        match packet.code {
            CP_CONFIGURE_REQUEST => {
                let ack = CpPacket {
                    code: CP_CONFIGURE_ACK,
                    identifier: packet.identifier,
                    data: packet.data.clone(),
                };
                Some(PppResponse {
                    protocol: PROTO_IPCP,
                    payload: ack.encode().freeze(),
                })
            }
            CP_CONFIGURE_ACK => {
                info!("IPCP Configure-Ack received, peer accepted address");
                None
            }
            CP_CONFIGURE_NAK | CP_CONFIGURE_REJECT => {
                warn!(code = packet.code, "IPCP configuration rejected by peer");
                None
            }
            code => {
                debug!(code, "Unhandled IPCP code");
                None
            }
        }
    }
}

impl PppEngine for DefaultPppEngine {
    fn process_frame(
        &self,
        protocol: u16,
        payload: &[u8],
    ) -> Result<Option<PppResponse>, PppError> {
        let packet = CpPacket::parse(payload)?;
        match protocol {
            PROTO_LCP => Ok(self.handle_lcp(&packet)),
            PROTO_PAP => self.handle_pap(&packet),
            PROTO_CHAP => Ok(self.handle_chap(&packet)),
            PROTO_IPCP => Ok(self.handle_ipcp(&packet)),
            _ => {
                debug!(protocol = format_args!("0x{protocol:04x}"), "Unhandled PPP protocol");
                Ok(None)
            }
        }
    }

    fn try_auth_result(&self) -> Option<bool> {
        self.verdict_rx.lock().try_recv().ok()
    }
}
