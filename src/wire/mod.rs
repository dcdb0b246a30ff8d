//! L2TP wire codec
//!
//! Pure, stateless encoding and decoding of the L2TP header and of
//! Attribute-Value Pairs. No I/O happens here; the server and client
//! drive the codec from their receive and send paths.

mod avp;
mod header;

pub use avp::{
    find_message_type, parse_avps, serialize_avps, Avp, ControlMessageType, AVP_ASSIGNED_SESSION_ID,
    AVP_ASSIGNED_TUNNEL_ID, AVP_BEARER_CAPABILITIES, AVP_CALL_SERIAL_NUMBER,
    AVP_FIRMWARE_REVISION, AVP_FRAMING_CAPABILITIES, AVP_FRAMING_TYPE, AVP_HOST_NAME,
    AVP_MESSAGE_TYPE, AVP_PROTOCOL_VERSION, AVP_RECEIVE_WINDOW_SIZE, AVP_RESULT_CODE,
    AVP_TX_CONNECT_SPEED, AVP_VENDOR_NAME, PROTOCOL_VERSION_1_0,
};
pub use header::{
    patch_length, L2tpHeader, FLAG_LENGTH, FLAG_OFFSET, FLAG_PRIORITY, FLAG_SEQUENCE, FLAG_TYPE,
    LENGTH_FIELD_OFFSET, L2TP_VERSION, VERSION_MASK,
};
