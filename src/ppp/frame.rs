//! PPP frame helpers
//!
//! Pure parsing and building of the PPP framing carried inside L2TP
//! data messages:
//!
//! ```text
//! Address (1 byte, 0xFF)   optional
//! Control (1 byte, 0x03)   optional
//! Protocol (2 bytes)
//! Information (variable)
//! ```
//!
//! The control protocols (LCP/PAP/CHAP/IPCP) all share the same
//! code/identifier/length packet layout, modeled here as [`CpPacket`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::PppError;

/// PPP Address field value
pub const PPP_ADDRESS: u8 = 0xFF;
/// PPP Control field value
pub const PPP_CONTROL: u8 = 0x03;

/// IPv4 in PPP
pub const PROTO_IPV4: u16 = 0x0021;
/// IP Control Protocol
pub const PROTO_IPCP: u16 = 0x8021;
/// Link Control Protocol
pub const PROTO_LCP: u16 = 0xC021;
/// Password Authentication Protocol
pub const PROTO_PAP: u16 = 0xC023;
/// Challenge Handshake Authentication Protocol
pub const PROTO_CHAP: u16 = 0xC223;

/// Control-protocol code: Configure-Request (LCP/IPCP)
pub const CP_CONFIGURE_REQUEST: u8 = 1;
/// Control-protocol code: Configure-Ack (LCP/IPCP)
pub const CP_CONFIGURE_ACK: u8 = 2;
/// Control-protocol code: Configure-Nak (LCP/IPCP)
pub const CP_CONFIGURE_NAK: u8 = 3;
/// Control-protocol code: Configure-Reject (LCP/IPCP)
pub const CP_CONFIGURE_REJECT: u8 = 4;

/// PAP code: Authenticate-Request
pub const PAP_AUTH_REQUEST: u8 = 1;
/// PAP code: Authenticate-Ack
pub const PAP_AUTH_ACK: u8 = 2;
/// PAP code: Authenticate-Nak
pub const PAP_AUTH_NAK: u8 = 3;

/// CHAP code: Response
pub const CHAP_RESPONSE: u8 = 2;
/// CHAP code: Success
pub const CHAP_SUCCESS: u8 = 3;

/// IPCP option: IP-Address
pub const IPCP_OPT_IP_ADDRESS: u8 = 3;

/// Strip the optional 2-byte Address/Control prefix if present
#[must_use]
pub fn strip_address_control(frame: &[u8]) -> &[u8] {
    if frame.len() >= 2 && frame[0] == PPP_ADDRESS && frame[1] == PPP_CONTROL {
        &frame[2..]
    } else {
        frame
    }
}

/// Split a PPP frame (already stripped of Address/Control) into its
/// 16-bit protocol field and information payload
///
/// # Errors
///
/// Returns [`PppError::FrameTooShort`] if fewer than 2 bytes remain.
pub fn split_protocol(frame: &[u8]) -> Result<(u16, &[u8]), PppError> {
    if frame.len() < 2 {
        return Err(PppError::FrameTooShort { len: frame.len() });
    }
    let protocol = u16::from_be_bytes([frame[0], frame[1]]);
    Ok((protocol, &frame[2..]))
}

/// Encode a PPP frame with Address/Control prefix
#[must_use]
pub fn encode(protocol: u16, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u8(PPP_ADDRESS);
    buf.put_u8(PPP_CONTROL);
    buf.put_u16(protocol);
    buf.put_slice(payload);
    buf
}

/// A control-protocol packet (LCP, PAP, CHAP and IPCP share this layout)
///
/// ```text
/// Code       (1 byte)
/// Identifier (1 byte)
/// Length     (2 bytes, includes this 4-byte header)
/// Data       (Length - 4 bytes)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpPacket {
    pub code: u8,
    pub identifier: u8,
    pub data: Bytes,
}

impl CpPacket {
    /// Parse a control-protocol packet from a PPP information field
    ///
    /// # Errors
    ///
    /// Returns [`PppError::PacketTruncated`] if the buffer is shorter
    /// than the 4-byte header or than the declared length.
    pub fn parse(data: &[u8]) -> Result<Self, PppError> {
        if data.len() < 4 {
            return Err(PppError::PacketTruncated {
                reason: "control packet shorter than 4-byte header",
            });
        }
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if length < 4 || length > data.len() {
            return Err(PppError::PacketTruncated {
                reason: "declared length out of bounds",
            });
        }
        Ok(Self {
            code: data[0],
            identifier: data[1],
            data: Bytes::copy_from_slice(&data[4..length]),
        })
    }

    /// Encode this packet, computing the length field
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        let total = 4 + self.data.len();
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(self.code);
        buf.put_u8(self.identifier);
        buf.put_u16(total as u16);
        buf.put_slice(&self.data);
        buf
    }
}

/// Parsed PAP Authenticate-Request credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PapCredentials {
    pub username: String,
    pub password: String,
}

/// Parse the data field of a PAP Authenticate-Request
///
/// Layout: `UsernameLen(1) + Username + PasswordLen(1) + Password`.
///
/// # Errors
///
/// Returns [`PppError::PacketTruncated`] if either length field
/// overruns the data.
pub fn parse_pap_request(data: &[u8]) -> Result<PapCredentials, PppError> {
    if data.is_empty() {
        return Err(PppError::PacketTruncated {
            reason: "PAP request missing username length",
        });
    }
    let username_len = data[0] as usize;
    if data.len() < 1 + username_len + 1 {
        return Err(PppError::PacketTruncated {
            reason: "PAP username overruns packet",
        });
    }
    let username = String::from_utf8_lossy(&data[1..1 + username_len]).into_owned();

    let password_len = data[1 + username_len] as usize;
    let password_start = 2 + username_len;
    if data.len() < password_start + password_len {
        return Err(PppError::PacketTruncated {
            reason: "PAP password overruns packet",
        });
    }
    let password =
        String::from_utf8_lossy(&data[password_start..password_start + password_len]).into_owned();

    Ok(PapCredentials { username, password })
}

/// Build the data field of a PAP Authenticate-Request
#[must_use]
pub fn build_pap_request(identifier: u8, username: &str, password: &str) -> CpPacket {
    let mut data = BytesMut::with_capacity(2 + username.len() + password.len());
    data.put_u8(username.len() as u8);
    data.put_slice(username.as_bytes());
    data.put_u8(password.len() as u8);
    data.put_slice(password.as_bytes());

    CpPacket {
        code: PAP_AUTH_REQUEST,
        identifier,
        data: data.freeze(),
    }
}

/// Build a PAP Ack/Nak carrying a result message
#[must_use]
pub fn build_pap_reply(code: u8, identifier: u8, message: &str) -> CpPacket {
    let mut data = BytesMut::with_capacity(1 + message.len());
    data.put_u8(message.len() as u8);
    data.put_slice(message.as_bytes());

    CpPacket {
        code,
        identifier,
        data: data.freeze(),
    }
}

/// Build a CHAP Success carrying a result message
#[must_use]
pub fn build_chap_success(identifier: u8, message: &str) -> CpPacket {
    CpPacket {
        code: CHAP_SUCCESS,
        identifier,
        data: Bytes::copy_from_slice(message.as_bytes()),
    }
}

/// Build an IPCP Configure-Request proposing `ip` via the IP-Address
/// option
#[must_use]
pub fn build_ipcp_configure_request(identifier: u8, ip: std::net::Ipv4Addr) -> CpPacket {
    let mut data = BytesMut::with_capacity(6);
    data.put_u8(IPCP_OPT_IP_ADDRESS);
    data.put_u8(6); // option length: type + len + 4-byte address
    data.put_slice(&ip.octets());

    CpPacket {
        code: CP_CONFIGURE_REQUEST,
        identifier,
        data: data.freeze(),
    }
}
