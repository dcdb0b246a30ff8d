//! PPP frame handling
//!
//! L2TP data messages carry PPP frames. This module provides the pure
//! framing helpers ([`frame`]) and the interfaces to the two external
//! collaborators the bridge routes payloads to: the PPP negotiation
//! engine and the IP packet sink ([`engine`]).
//!
//! The bridge itself lives on the server (`server::ppp_bridge`), since
//! it needs the IP pool and the data-message send path.

pub mod engine;
pub mod frame;

pub use crate::error::PppError;

pub use engine::{
    AuthFn, ChannelPacketSink, DefaultPppEngine, InboundPacket, PacketSink, PppEngine, PppResponse,
};
pub use frame::{
    build_chap_success, build_ipcp_configure_request, build_pap_reply, build_pap_request, encode,
    parse_pap_request, split_protocol, strip_address_control, CpPacket, PapCredentials,
    CP_CONFIGURE_ACK, CP_CONFIGURE_REQUEST, PROTO_CHAP, PROTO_IPCP, PROTO_IPV4, PROTO_LCP,
    PROTO_PAP,
};
