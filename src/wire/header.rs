//! L2TPv2 header encoding and decoding
//!
//! Implements the L2TP packet header. The header is a fixed 6-byte core
//! (flags+version, tunnel ID, session ID) followed by optional fields
//! whose presence is advertised in the flags word:
//!
//! ```text
//! Flags+Ver (2 bytes)   T L x x S x O P x x x x Ver(4)
//! Tunnel ID (2 bytes)
//! Session ID(2 bytes)
//! Length    (2 bytes)   present iff L
//! Ns        (2 bytes)   present iff S
//! Nr        (2 bytes)   present iff S
//! Offset Sz (2 bytes)   present iff O (+ padding bytes, skipped)
//! ```
//!
//! The length field, when present, is never trusted as authoritative on
//! decode beyond bounds-checking: it is always recomputed and patched
//! into the serialized header once the full message length is known.

use bytes::{BufMut, BytesMut};

use crate::error::CodecError;

/// T bit: control message (data message when clear)
pub const FLAG_TYPE: u16 = 0x8000;
/// L bit: length field present
pub const FLAG_LENGTH: u16 = 0x4000;
/// S bit: Ns/Nr sequence fields present
pub const FLAG_SEQUENCE: u16 = 0x0800;
/// O bit: offset-size field present
pub const FLAG_OFFSET: u16 = 0x0200;
/// P bit: priority (data messages only)
pub const FLAG_PRIORITY: u16 = 0x0100;
/// Version nibble mask
pub const VERSION_MASK: u16 = 0x000F;
/// Protocol version, fixed at 2 for L2TPv2
pub const L2TP_VERSION: u16 = 0x0002;

/// Byte offset of the length field within a serialized header that has
/// the L bit set. Used by senders to patch the final message length.
pub const LENGTH_FIELD_OFFSET: usize = 6;

/// Minimum header size: flags + tunnel ID + session ID
const MIN_HEADER_SIZE: usize = 6;

/// A decoded L2TP packet header
///
/// `ns`, `nr` and `offset_size` are only meaningful when the
/// corresponding flag bit is set; they decode as zero otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2tpHeader {
    /// Flags and version word
    pub flags: u16,
    /// Tunnel ID (peer's ID on outbound messages)
    pub tunnel_id: u16,
    /// Session ID (0 for tunnel-scoped control messages)
    pub session_id: u16,
    /// Send sequence number (valid iff `has_sequence()`)
    pub ns: u16,
    /// Receive sequence number (valid iff `has_sequence()`)
    pub nr: u16,
    /// Offset size (valid iff `has_offset()`; padding is skipped on decode)
    pub offset_size: u16,
}

impl L2tpHeader {
    /// Build a control-message header (T, L and S bits set)
    #[must_use]
    pub fn control(tunnel_id: u16, session_id: u16, ns: u16, nr: u16) -> Self {
        Self {
            flags: FLAG_TYPE | FLAG_LENGTH | FLAG_SEQUENCE | L2TP_VERSION,
            tunnel_id,
            session_id,
            ns,
            nr,
            offset_size: 0,
        }
    }

    /// Build a data-message header (version bits only)
    #[must_use]
    pub fn data(tunnel_id: u16, session_id: u16) -> Self {
        Self {
            flags: L2TP_VERSION,
            tunnel_id,
            session_id,
            ns: 0,
            nr: 0,
            offset_size: 0,
        }
    }

    /// Whether the T bit is set (control message)
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.flags & FLAG_TYPE != 0
    }

    /// Whether the L bit is set (length field present)
    #[must_use]
    pub fn has_length(&self) -> bool {
        self.flags & FLAG_LENGTH != 0
    }

    /// Whether the S bit is set (Ns/Nr present)
    #[must_use]
    pub fn has_sequence(&self) -> bool {
        self.flags & FLAG_SEQUENCE != 0
    }

    /// Whether the O bit is set (offset-size present)
    #[must_use]
    pub fn has_offset(&self) -> bool {
        self.flags & FLAG_OFFSET != 0
    }

    /// Protocol version nibble
    #[must_use]
    pub fn version(&self) -> u16 {
        self.flags & VERSION_MASK
    }

    /// Parse a header from the start of `data`
    ///
    /// Returns the decoded header and the number of bytes consumed,
    /// including any offset padding. The caller slices the remainder as
    /// AVPs (control) or a PPP frame (data).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TruncatedHeader`] if `data` is shorter than
    /// the fixed core or than any flagged optional field requires.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), CodecError> {
        if data.len() < MIN_HEADER_SIZE {
            return Err(CodecError::TruncatedHeader {
                need: MIN_HEADER_SIZE,
                have: data.len(),
            });
        }

        let flags = u16::from_be_bytes([data[0], data[1]]);
        let tunnel_id = u16::from_be_bytes([data[2], data[3]]);
        let session_id = u16::from_be_bytes([data[4], data[5]]);
        let mut pos = 6;

        let mut read_u16 = |pos: &mut usize| -> Result<u16, CodecError> {
            if data.len() < *pos + 2 {
                return Err(CodecError::TruncatedHeader {
                    need: *pos + 2,
                    have: data.len(),
                });
            }
            let v = u16::from_be_bytes([data[*pos], data[*pos + 1]]);
            *pos += 2;
            Ok(v)
        };

        // Length is bounds-checked but otherwise ignored: the true
        // message length is the datagram length.
        if flags & FLAG_LENGTH != 0 {
            let _ = read_u16(&mut pos)?;
        }

        let (ns, nr) = if flags & FLAG_SEQUENCE != 0 {
            (read_u16(&mut pos)?, read_u16(&mut pos)?)
        } else {
            (0, 0)
        };

        let offset_size = if flags & FLAG_OFFSET != 0 {
            let size = read_u16(&mut pos)?;
            // Skip the offset padding itself.
            if data.len() < pos + size as usize {
                return Err(CodecError::TruncatedHeader {
                    need: pos + size as usize,
                    have: data.len(),
                });
            }
            pos += size as usize;
            size
        } else {
            0
        };

        Ok((
            Self {
                flags,
                tunnel_id,
                session_id,
                ns,
                nr,
                offset_size,
            },
            pos,
        ))
    }

    /// Serialize the header into a fresh buffer
    ///
    /// If the L bit is set, a zero placeholder is written for the length
    /// field; the caller must patch it via [`patch_length`] once the
    /// total message length is known (the codec never knows the AVP or
    /// payload length at header-serialization time).
    #[must_use]
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(14);
        buf.put_u16(self.flags);
        buf.put_u16(self.tunnel_id);
        buf.put_u16(self.session_id);
        if self.has_length() {
            buf.put_u16(0); // placeholder, patched by the sender
        }
        if self.has_sequence() {
            buf.put_u16(self.ns);
            buf.put_u16(self.nr);
        }
        if self.has_offset() {
            buf.put_u16(self.offset_size);
            buf.put_bytes(0, self.offset_size as usize);
        }
        buf
    }
}

/// Patch the length field of a serialized control message in place
///
/// `packet` must start with a header whose L bit is set; the total
/// packet length is written at [`LENGTH_FIELD_OFFSET`].
pub fn patch_length(packet: &mut [u8]) {
    debug_assert!(packet.len() >= LENGTH_FIELD_OFFSET + 2);
    let total = packet.len() as u16;
    packet[LENGTH_FIELD_OFFSET..LENGTH_FIELD_OFFSET + 2].copy_from_slice(&total.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_header_roundtrip() {
        let header = L2tpHeader::control(42, 7, 3, 9);
        let mut buf = header.serialize();
        patch_length(&mut buf);

        let (parsed, consumed) = L2tpHeader::parse(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(parsed.tunnel_id, 42);
        assert_eq!(parsed.session_id, 7);
        assert_eq!(parsed.ns, 3);
        assert_eq!(parsed.nr, 9);
        assert!(parsed.is_control());
        assert!(parsed.has_length());
        assert!(parsed.has_sequence());
        assert_eq!(parsed.version(), 2);
    }

    #[test]
    fn test_data_header_roundtrip() {
        let header = L2tpHeader::data(100, 200);
        let buf = header.serialize();
        assert_eq!(buf.len(), 6);

        let (parsed, consumed) = L2tpHeader::parse(&buf).unwrap();
        assert_eq!(consumed, 6);
        assert!(!parsed.is_control());
        assert!(!parsed.has_sequence());
        assert_eq!(parsed.tunnel_id, 100);
        assert_eq!(parsed.session_id, 200);
    }

    #[test]
    fn test_truncated_header() {
        let err = L2tpHeader::parse(&[0x00]).unwrap_err();
        assert!(matches!(err, CodecError::TruncatedHeader { have: 1, .. }));

        // Control header claims sequence fields but the buffer ends
        // after the session ID.
        let flags = FLAG_TYPE | FLAG_SEQUENCE | L2TP_VERSION;
        let mut buf = Vec::new();
        buf.extend_from_slice(&flags.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&2u16.to_be_bytes());
        assert!(matches!(
            L2tpHeader::parse(&buf),
            Err(CodecError::TruncatedHeader { .. })
        ));
    }

    #[test]
    fn test_offset_padding_skipped() {
        let flags = FLAG_OFFSET | L2TP_VERSION;
        let mut buf = Vec::new();
        buf.extend_from_slice(&flags.to_be_bytes());
        buf.extend_from_slice(&5u16.to_be_bytes()); // tunnel
        buf.extend_from_slice(&6u16.to_be_bytes()); // session
        buf.extend_from_slice(&4u16.to_be_bytes()); // offset size
        buf.extend_from_slice(&[0xAA; 4]); // offset padding
        buf.extend_from_slice(&[0xBB; 3]); // payload

        let (header, consumed) = L2tpHeader::parse(&buf).unwrap();
        assert_eq!(header.offset_size, 4);
        assert_eq!(consumed, 12);
        assert_eq!(&buf[consumed..], &[0xBB; 3]);
    }

    #[test]
    fn test_offset_padding_truncated() {
        let flags = FLAG_OFFSET | L2TP_VERSION;
        let mut buf = Vec::new();
        buf.extend_from_slice(&flags.to_be_bytes());
        buf.extend_from_slice(&5u16.to_be_bytes());
        buf.extend_from_slice(&6u16.to_be_bytes());
        buf.extend_from_slice(&10u16.to_be_bytes()); // claims 10 padding bytes
        buf.extend_from_slice(&[0x00; 2]); // only 2 present

        assert!(matches!(
            L2tpHeader::parse(&buf),
            Err(CodecError::TruncatedHeader { .. })
        ));
    }

    #[test]
    fn test_patch_length() {
        let header = L2tpHeader::control(1, 0, 0, 0);
        let mut buf = header.serialize();
        buf.extend_from_slice(&[0u8; 20]); // fake AVP payload
        patch_length(&mut buf);

        let patched = u16::from_be_bytes([
            buf[LENGTH_FIELD_OFFSET],
            buf[LENGTH_FIELD_OFFSET + 1],
        ]);
        assert_eq!(patched as usize, buf.len());
    }
}
