// ABOUTME: Wire-level codec for the multiplexed RPC link protocol
// ABOUTME: Defines the command byte set, flag bits, and bounds-checked field decode/encode helpers

use bytes::{Buf, BufMut, BytesMut};
use num_enum::TryFromPrimitive;
use std::io::Cursor;
use thiserror::Error;

/// Maximum allowed frame body size to prevent memory exhaustion attacks
pub const MAX_FRAME_SIZE: u32 = 65536; // 64KB

/// Width of the length prefix the transport fills in before transmission.
///
/// Frames originated by the engine start with this many placeholder bytes;
/// `Transport::send_blocking` back-patches them with the body length.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Marks the first frame of a multi-frame request/reply payload, establishing
/// the per-id byte input. The remaining flag bits are reserved and must be
/// zero.
pub const MSG_FLAG_FIRST: u8 = 0x01;

/// Command bytes of the link protocol.
///
/// The numeric assignment is stable; both peers must agree on it. Grouping:
/// `0x1x` service-open negotiation, `0x2x` requests, `0x3x` replies, `0x4x`
/// streams, `0x01` keepalive.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    /// Keepalive; resets the peer-liveness timer
    Alive = 0x01,

    /// Open a service across the link (id, serviceType, groupName, option map)
    ServiceRequest = 0x10,
    /// Negative open reply: no such service registered
    ServiceNotFound = 0x11,
    /// Negative open reply: service lookup or option decoding failed
    ServiceError = 0x12,
    /// Positive open reply: the peer installed an inbound client for the id
    ServiceClientOpened = 0x13,
    /// The opening side is done with its client; tears down the inbound client
    ChannelClose = 0x14,
    /// The service side closed the client asynchronously
    ClientAsyncClose = 0x15,

    /// Request payload frame (rid, flags, [cid on FIRST], chunk)
    Request = 0x20,
    /// The originator abandoned the request
    RequestAbort = 0x21,
    /// One request chunk was consumed by the responder
    RequestAckChunk = 0x22,

    /// Reply payload frame (rid, flags, chunk)
    Reply = 0x30,
    /// One reply chunk was consumed by the originator
    ReplyAckChunk = 0x31,
    /// Exception reply payload frame; same framing as Reply
    ReplyException = 0x32,
    /// The responder abandoned an in-progress exception reply
    ReplyExceptionAbort = 0x33,

    /// Stream payload chunk (sid, chunk)
    StreamData = 0x40,
    /// End of stream
    StreamClose = 0x41,
    /// Stream terminated with an error
    StreamException = 0x42,
    /// One stream chunk was consumed by the receiver
    StreamAck = 0x43,
    /// Receiver-side asynchronous start notification
    StreamAsyncStart = 0x44,
    /// Receiver-side asynchronous close notification
    StreamAsyncClose = 0x45,
    /// Receiver-side asynchronous exception notification
    StreamAsyncException = 0x46,
}

/// Codec errors with detailed context for debugging
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Incomplete frame: need more data")]
    Incomplete,

    #[error("Invalid command byte: {0:#04x}")]
    InvalidCommand(u8),

    #[error("Invalid frame length: {length}, maximum {max}")]
    InvalidFrameLength { length: u32, max: u32 },

    #[error("Reserved flag bits set: {0:#04x}")]
    ReservedFlags(u8),

    #[error("Field '{field}' validation failed: {reason}")]
    FieldValidation { field: &'static str, reason: String },

    #[error("UTF-8 decoding error in field '{field}': {source}")]
    Utf8Error {
        field: &'static str,
        #[source]
        source: std::string::FromUtf8Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode a single byte
pub fn decode_u8(buf: &mut Cursor<&[u8]>) -> Result<u8, CodecError> {
    if !buf.has_remaining() {
        return Err(CodecError::Incomplete);
    }
    Ok(buf.get_u8())
}

/// Decode a 32-bit big-endian integer
pub fn decode_u32(buf: &mut Cursor<&[u8]>) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Incomplete);
    }
    Ok(buf.get_u32())
}

/// Peek at the next 4 bytes without advancing the cursor (for the length prefix)
pub fn peek_u32(buf: &mut Cursor<&[u8]>) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Incomplete);
    }

    let pos = buf.position();
    let value = buf.get_u32();
    buf.set_position(pos);
    Ok(value)
}

/// Decode a NUL-terminated UTF-8 string.
///
/// Unlike fixed-width protocol fields there is no padding: the cursor stops
/// just past the terminator. A missing terminator is a framing error.
pub fn decode_cstring(
    buf: &mut Cursor<&[u8]>,
    field_name: &'static str,
) -> Result<String, CodecError> {
    let chunk = buf.chunk();
    let end = chunk
        .iter()
        .position(|&b| b == 0)
        .ok_or(CodecError::FieldValidation {
            field: field_name,
            reason: "missing NUL terminator".to_string(),
        })?;

    let string_bytes = chunk[..end].to_vec();
    buf.advance(end + 1);

    String::from_utf8(string_bytes).map_err(|e| CodecError::Utf8Error {
        field: field_name,
        source: e,
    })
}

/// Encode a NUL-terminated UTF-8 string
pub fn encode_cstring(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

/// Encode a 32-bit big-endian integer
pub fn encode_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u32(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_u8_advances_cursor() {
        let data: &[u8] = &[10, 9, 8];
        let mut buf = Cursor::new(data);

        assert_eq!(decode_u8(&mut buf).unwrap(), 10);
        assert_eq!(buf.remaining(), 2);
    }

    #[test]
    fn decode_u32_big_endian() {
        let data: &[u8] = &[0x00, 0x00, 0x00, 0x07, 0xFF];
        let mut buf = Cursor::new(data);

        assert_eq!(decode_u32(&mut buf).unwrap(), 7);
        assert_eq!(buf.remaining(), 1);
    }

    #[test]
    fn decode_u32_incomplete() {
        let data: &[u8] = &[0x00, 0x01];
        let mut buf = Cursor::new(data);

        assert!(matches!(decode_u32(&mut buf), Err(CodecError::Incomplete)));
    }

    #[test]
    fn peek_u32_does_not_advance() {
        let data: &[u8] = &[0x00, 0x00, 0x00, 0x2A];
        let mut buf = Cursor::new(data);

        assert_eq!(peek_u32(&mut buf).unwrap(), 42);
        assert_eq!(buf.remaining(), 4);
    }

    #[test]
    fn cstring_roundtrip() {
        let mut out = BytesMut::new();
        encode_cstring(&mut out, "org.example.echo");

        let frozen = out.freeze();
        let mut buf = Cursor::new(frozen.as_ref());
        let decoded = decode_cstring(&mut buf, "service_type").unwrap();

        assert_eq!(decoded, "org.example.echo");
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn cstring_empty() {
        let data: &[u8] = &[0x00, 0xAA];
        let mut buf = Cursor::new(data);

        assert_eq!(decode_cstring(&mut buf, "group_name").unwrap(), "");
        assert_eq!(buf.remaining(), 1);
    }

    #[test]
    fn cstring_missing_terminator() {
        let data: &[u8] = b"never-ends";
        let mut buf = Cursor::new(data);

        let result = decode_cstring(&mut buf, "service_type");
        assert!(matches!(
            result,
            Err(CodecError::FieldValidation { field: "service_type", .. })
        ));
    }

    #[test]
    fn cstring_invalid_utf8() {
        let data: &[u8] = &[0xFF, 0xFE, 0x00];
        let mut buf = Cursor::new(data);

        let result = decode_cstring(&mut buf, "service_type");
        assert!(matches!(result, Err(CodecError::Utf8Error { .. })));
    }

    #[test]
    fn command_from_byte() {
        assert_eq!(Command::try_from(0x10).unwrap(), Command::ServiceRequest);
        assert_eq!(Command::try_from(0x46).unwrap(), Command::StreamAsyncException);
        assert!(Command::try_from(0xFFu8).is_err());
    }
}
