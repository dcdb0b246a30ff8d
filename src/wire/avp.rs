//! Attribute-Value Pair encoding and decoding
//!
//! Every L2TP control-message parameter travels as an AVP (RFC 2661
//! §4.1). A control message is exactly a header followed by a flat
//! sequence of AVPs with no padding between them.
//!
//! ```text
//! Flags+Length (2 bytes)   M H V x x x Len(10)
//! Vendor ID    (2 bytes)   present iff V
//! Type         (2 bytes)
//! Value        (Len - header bytes)
//! ```
//!
//! The low 10 bits of the first word encode the total AVP length
//! including its own header.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// M bit: mandatory AVP
const AVP_FLAG_MANDATORY: u16 = 0x8000;
/// H bit: hidden AVP (value scrambled with a shared secret; carried opaque)
const AVP_FLAG_HIDDEN: u16 = 0x4000;
/// V bit: vendor ID field present
const AVP_FLAG_VENDOR: u16 = 0x2000;
/// Low 10 bits: total AVP length including header
const AVP_LENGTH_MASK: u16 = 0x03FF;

/// Minimum AVP size without a vendor ID: flags+length word and type
const AVP_MIN_SIZE: usize = 6;
/// Minimum AVP size with a vendor ID
const AVP_MIN_SIZE_VENDOR: usize = 8;

// Attribute types used by this implementation (RFC 2661 §4.4).
pub const AVP_MESSAGE_TYPE: u16 = 0;
pub const AVP_RESULT_CODE: u16 = 1;
pub const AVP_PROTOCOL_VERSION: u16 = 2;
pub const AVP_FRAMING_CAPABILITIES: u16 = 3;
pub const AVP_BEARER_CAPABILITIES: u16 = 4;
pub const AVP_FIRMWARE_REVISION: u16 = 6;
pub const AVP_HOST_NAME: u16 = 7;
pub const AVP_VENDOR_NAME: u16 = 8;
pub const AVP_ASSIGNED_TUNNEL_ID: u16 = 9;
pub const AVP_RECEIVE_WINDOW_SIZE: u16 = 10;
pub const AVP_ASSIGNED_SESSION_ID: u16 = 14;
pub const AVP_CALL_SERIAL_NUMBER: u16 = 15;
pub const AVP_FRAMING_TYPE: u16 = 19;
pub const AVP_TX_CONNECT_SPEED: u16 = 24;

/// Protocol Version AVP value: version 1, revision 0
pub const PROTOCOL_VERSION_1_0: u16 = 0x0100;

/// The set of control messages defined by RFC 2661
///
/// The message set is fixed and closed; dispatch is an explicit match,
/// not a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMessageType {
    /// Start-Control-Connection-Request
    Sccrq,
    /// Start-Control-Connection-Reply
    Sccrp,
    /// Start-Control-Connection-Connected
    Scccn,
    /// Stop-Control-Connection-Notification
    StopCcn,
    /// Keep-alive
    Hello,
    /// Outgoing-Call-Request
    Ocrq,
    /// Outgoing-Call-Reply
    Ocrp,
    /// Outgoing-Call-Connected
    Occn,
    /// Incoming-Call-Request
    Icrq,
    /// Incoming-Call-Reply
    Icrp,
    /// Incoming-Call-Connected
    Iccn,
    /// Call-Disconnect-Notify
    Cdn,
}

impl ControlMessageType {
    /// Decode a message-type code; `None` for unknown codes
    #[must_use]
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::Sccrq),
            2 => Some(Self::Sccrp),
            3 => Some(Self::Scccn),
            4 => Some(Self::StopCcn),
            6 => Some(Self::Hello),
            7 => Some(Self::Ocrq),
            8 => Some(Self::Ocrp),
            9 => Some(Self::Occn),
            10 => Some(Self::Icrq),
            11 => Some(Self::Icrp),
            12 => Some(Self::Iccn),
            14 => Some(Self::Cdn),
            _ => None,
        }
    }

    /// Wire code for this message type
    #[must_use]
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Sccrq => 1,
            Self::Sccrp => 2,
            Self::Scccn => 3,
            Self::StopCcn => 4,
            Self::Hello => 6,
            Self::Ocrq => 7,
            Self::Ocrp => 8,
            Self::Occn => 9,
            Self::Icrq => 10,
            Self::Icrp => 11,
            Self::Iccn => 12,
            Self::Cdn => 14,
        }
    }
}

/// A decoded Attribute-Value Pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avp {
    /// M bit: the receiver must understand this AVP
    pub mandatory: bool,
    /// H bit: value is hidden (carried opaque, never unscrambled here)
    pub hidden: bool,
    /// Vendor ID; 0 for standard IETF attributes
    pub vendor_id: u16,
    /// Attribute type
    pub avp_type: u16,
    /// Opaque attribute value
    pub value: Bytes,
}

impl Avp {
    /// Build a standard (vendor 0) AVP with a raw value
    #[must_use]
    pub fn new(avp_type: u16, value: impl Into<Bytes>, mandatory: bool) -> Self {
        Self {
            mandatory,
            hidden: false,
            vendor_id: 0,
            avp_type,
            value: value.into(),
        }
    }

    /// Build an AVP carrying a big-endian u16 value
    #[must_use]
    pub fn u16_avp(avp_type: u16, value: u16, mandatory: bool) -> Self {
        Self::new(avp_type, value.to_be_bytes().to_vec(), mandatory)
    }

    /// Build an AVP carrying a big-endian u32 value
    #[must_use]
    pub fn u32_avp(avp_type: u16, value: u32, mandatory: bool) -> Self {
        Self::new(avp_type, value.to_be_bytes().to_vec(), mandatory)
    }

    /// Build an AVP carrying a string value
    #[must_use]
    pub fn string_avp(avp_type: u16, value: &str, mandatory: bool) -> Self {
        Self::new(avp_type, value.as_bytes().to_vec(), mandatory)
    }

    /// Parse one AVP from the start of `data`
    ///
    /// Returns the decoded AVP and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// * [`CodecError::AvpTooShort`] if the declared length is below the
    ///   minimum header size (6, or 8 with the vendor bit set), or the
    ///   buffer ends before the flags word.
    /// * [`CodecError::AvpOverrun`] if the declared length exceeds the
    ///   remaining buffer.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), CodecError> {
        if data.len() < 2 {
            return Err(CodecError::AvpTooShort {
                declared: data.len(),
                minimum: AVP_MIN_SIZE,
            });
        }

        let word = u16::from_be_bytes([data[0], data[1]]);
        let mandatory = word & AVP_FLAG_MANDATORY != 0;
        let hidden = word & AVP_FLAG_HIDDEN != 0;
        let has_vendor = word & AVP_FLAG_VENDOR != 0;
        let declared = (word & AVP_LENGTH_MASK) as usize;

        let minimum = if has_vendor {
            AVP_MIN_SIZE_VENDOR
        } else {
            AVP_MIN_SIZE
        };

        if declared < minimum {
            return Err(CodecError::AvpTooShort { declared, minimum });
        }
        if declared > data.len() {
            return Err(CodecError::AvpOverrun {
                declared,
                remaining: data.len(),
            });
        }

        let (vendor_id, type_offset) = if has_vendor {
            (u16::from_be_bytes([data[2], data[3]]), 4)
        } else {
            (0, 2)
        };
        let avp_type = u16::from_be_bytes([data[type_offset], data[type_offset + 1]]);
        let value = Bytes::copy_from_slice(&data[type_offset + 2..declared]);

        Ok((
            Self {
                mandatory,
                hidden,
                vendor_id,
                avp_type,
                value,
            },
            declared,
        ))
    }

    /// Serialize this AVP, vendor-ID-aware
    #[must_use]
    pub fn serialize(&self) -> BytesMut {
        let has_vendor = self.vendor_id != 0;
        let header_len = if has_vendor {
            AVP_MIN_SIZE_VENDOR
        } else {
            AVP_MIN_SIZE
        };
        let total = header_len + self.value.len();

        let mut word = (total as u16) & AVP_LENGTH_MASK;
        if self.mandatory {
            word |= AVP_FLAG_MANDATORY;
        }
        if self.hidden {
            word |= AVP_FLAG_HIDDEN;
        }
        if has_vendor {
            word |= AVP_FLAG_VENDOR;
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u16(word);
        if has_vendor {
            buf.put_u16(self.vendor_id);
        }
        buf.put_u16(self.avp_type);
        buf.put_slice(&self.value);
        buf
    }

    /// Read the value as a big-endian u16
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ValueTooShort`] if the value holds fewer
    /// than 2 bytes.
    pub fn value_u16(&self) -> Result<u16, CodecError> {
        if self.value.len() < 2 {
            return Err(CodecError::ValueTooShort {
                need: 2,
                have: self.value.len(),
            });
        }
        Ok(u16::from_be_bytes([self.value[0], self.value[1]]))
    }

    /// Read the value as a big-endian u32
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ValueTooShort`] if the value holds fewer
    /// than 4 bytes.
    pub fn value_u32(&self) -> Result<u32, CodecError> {
        if self.value.len() < 4 {
            return Err(CodecError::ValueTooShort {
                need: 4,
                have: self.value.len(),
            });
        }
        Ok(u32::from_be_bytes([
            self.value[0],
            self.value[1],
            self.value[2],
            self.value[3],
        ]))
    }

    /// Read the value as a string; any byte sequence is a valid opaque
    /// string, so this never fails
    #[must_use]
    pub fn value_string(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Parse a flat sequence of AVPs until the buffer is exhausted
///
/// Partial-result contract: a parse error on any AVP aborts and returns
/// the AVPs decoded so far alongside the error, which is useful for
/// diagnostics on malformed peers.
#[must_use]
pub fn parse_avps(payload: &[u8]) -> (Vec<Avp>, Option<CodecError>) {
    let mut avps = Vec::new();
    let mut pos = 0;

    while pos < payload.len() {
        match Avp::parse(&payload[pos..]) {
            Ok((avp, consumed)) => {
                avps.push(avp);
                pos += consumed;
            }
            Err(e) => return (avps, Some(e)),
        }
    }

    (avps, None)
}

/// Serialize a sequence of AVPs back-to-back with no padding
#[must_use]
pub fn serialize_avps(avps: &[Avp]) -> BytesMut {
    let mut buf = BytesMut::new();
    for avp in avps {
        buf.extend_from_slice(&avp.serialize());
    }
    buf
}

/// Scan a decoded AVP list for the MessageType attribute (type 0)
///
/// The MessageType AVP is semantically required first but is not
/// necessarily first on the wire, so all AVPs are scanned.
#[must_use]
pub fn find_message_type(avps: &[Avp]) -> Option<u16> {
    avps.iter()
        .find(|avp| avp.avp_type == AVP_MESSAGE_TYPE && avp.vendor_id == 0)
        .and_then(|avp| avp.value_u16().ok())
}
