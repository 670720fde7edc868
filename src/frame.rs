//! Provides a type representing a single protocol frame as well as utilities
//! for parsing frame bodies and composing frames for transmission.
//!
//! A frame on the wire is a 4-byte big-endian body length followed by the
//! body; the body starts with the command byte. [`Frame::check`] validates a
//! length-prefixed frame in a read buffer, [`Frame::parse`] decodes a body
//! whose length prefix has already been stripped, and [`Frame::encode`]
//! composes a body (without the prefix) for the transport to frame.

use crate::codec::{
    self, decode_cstring, decode_u8, decode_u32, encode_cstring, CodecError, Command,
    MAX_FRAME_SIZE, MSG_FLAG_FIRST,
};
use bytes::{BufMut, Bytes, BytesMut};
use core::fmt;
use std::io::Cursor;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Alive,
    ServiceRequest {
        id: u32,
        service_type: String,
        group_name: String,
        /// Marshalled option map, decoded by the marshaller collaborator
        options: Bytes,
    },
    ServiceNotFound { id: u32 },
    ServiceError { id: u32 },
    ServiceClientOpened { id: u32 },
    ChannelClose { id: u32 },
    ClientAsyncClose { id: u32 },
    Request {
        rid: u32,
        flags: u8,
        /// Target inbound client; present only when MSG_FLAG_FIRST is set
        client_id: Option<u32>,
        payload: Bytes,
    },
    RequestAbort { rid: u32 },
    RequestAckChunk { rid: u32 },
    Reply { rid: u32, flags: u8, payload: Bytes },
    ReplyAckChunk { rid: u32 },
    ReplyException { rid: u32, flags: u8, payload: Bytes },
    ReplyExceptionAbort { rid: u32 },
    StreamData { sid: u32, payload: Bytes },
    StreamClose { sid: u32 },
    StreamException { sid: u32 },
    StreamAck { sid: u32 },
    StreamAsyncStart { sid: u32 },
    StreamAsyncClose { sid: u32 },
    StreamAsyncException { sid: u32 },
}

impl Frame {
    /// Checks whether a complete length-prefixed frame is buffered in `src`.
    /// On success, returns the body length; the cursor is left at the start
    /// of the prefix.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<usize, CodecError> {
        let body_len = codec::peek_u32(src)?;

        if body_len == 0 || body_len > MAX_FRAME_SIZE {
            return Err(CodecError::InvalidFrameLength {
                length: body_len,
                max: MAX_FRAME_SIZE,
            });
        }

        if src.get_ref().len() < 4 + body_len as usize {
            return Err(CodecError::Incomplete);
        }

        Ok(body_len as usize)
    }

    /// Parses a frame body (length prefix already stripped). The first byte
    /// is the command; payload-bearing frames keep their payload as a
    /// zero-copy slice of `body`.
    pub fn parse(body: &Bytes) -> Result<Frame, CodecError> {
        let mut buf = Cursor::new(body.as_ref());

        let cmd_byte = decode_u8(&mut buf)?;
        let command =
            Command::try_from(cmd_byte).map_err(|_| CodecError::InvalidCommand(cmd_byte))?;

        let frame = match command {
            Command::Alive => Frame::Alive,
            Command::ServiceRequest => {
                let id = decode_u32(&mut buf)?;
                let service_type = decode_cstring(&mut buf, "service_type")?;
                let group_name = decode_cstring(&mut buf, "group_name")?;
                let options = body.slice(buf.position() as usize..);
                Frame::ServiceRequest {
                    id,
                    service_type,
                    group_name,
                    options,
                }
            }
            Command::ServiceNotFound => Frame::ServiceNotFound {
                id: decode_u32(&mut buf)?,
            },
            Command::ServiceError => Frame::ServiceError {
                id: decode_u32(&mut buf)?,
            },
            Command::ServiceClientOpened => Frame::ServiceClientOpened {
                id: decode_u32(&mut buf)?,
            },
            Command::ChannelClose => Frame::ChannelClose {
                id: decode_u32(&mut buf)?,
            },
            Command::ClientAsyncClose => Frame::ClientAsyncClose {
                id: decode_u32(&mut buf)?,
            },
            Command::Request => {
                let rid = decode_u32(&mut buf)?;
                let flags = check_flags(decode_u8(&mut buf)?)?;
                let client_id = if flags & MSG_FLAG_FIRST != 0 {
                    Some(decode_u32(&mut buf)?)
                } else {
                    None
                };
                let payload = body.slice(buf.position() as usize..);
                Frame::Request {
                    rid,
                    flags,
                    client_id,
                    payload,
                }
            }
            Command::RequestAbort => Frame::RequestAbort {
                rid: decode_u32(&mut buf)?,
            },
            Command::RequestAckChunk => Frame::RequestAckChunk {
                rid: decode_u32(&mut buf)?,
            },
            Command::Reply => {
                let rid = decode_u32(&mut buf)?;
                let flags = check_flags(decode_u8(&mut buf)?)?;
                let payload = body.slice(buf.position() as usize..);
                Frame::Reply { rid, flags, payload }
            }
            Command::ReplyAckChunk => Frame::ReplyAckChunk {
                rid: decode_u32(&mut buf)?,
            },
            Command::ReplyException => {
                let rid = decode_u32(&mut buf)?;
                let flags = check_flags(decode_u8(&mut buf)?)?;
                let payload = body.slice(buf.position() as usize..);
                Frame::ReplyException { rid, flags, payload }
            }
            Command::ReplyExceptionAbort => Frame::ReplyExceptionAbort {
                rid: decode_u32(&mut buf)?,
            },
            Command::StreamData => {
                let sid = decode_u32(&mut buf)?;
                let payload = body.slice(buf.position() as usize..);
                Frame::StreamData { sid, payload }
            }
            Command::StreamClose => Frame::StreamClose {
                sid: decode_u32(&mut buf)?,
            },
            Command::StreamException => Frame::StreamException {
                sid: decode_u32(&mut buf)?,
            },
            Command::StreamAck => Frame::StreamAck {
                sid: decode_u32(&mut buf)?,
            },
            Command::StreamAsyncStart => Frame::StreamAsyncStart {
                sid: decode_u32(&mut buf)?,
            },
            Command::StreamAsyncClose => Frame::StreamAsyncClose {
                sid: decode_u32(&mut buf)?,
            },
            Command::StreamAsyncException => Frame::StreamAsyncException {
                sid: decode_u32(&mut buf)?,
            },
        };

        Ok(frame)
    }

    /// The command byte this frame carries
    pub fn command(&self) -> Command {
        match self {
            Frame::Alive => Command::Alive,
            Frame::ServiceRequest { .. } => Command::ServiceRequest,
            Frame::ServiceNotFound { .. } => Command::ServiceNotFound,
            Frame::ServiceError { .. } => Command::ServiceError,
            Frame::ServiceClientOpened { .. } => Command::ServiceClientOpened,
            Frame::ChannelClose { .. } => Command::ChannelClose,
            Frame::ClientAsyncClose { .. } => Command::ClientAsyncClose,
            Frame::Request { .. } => Command::Request,
            Frame::RequestAbort { .. } => Command::RequestAbort,
            Frame::RequestAckChunk { .. } => Command::RequestAckChunk,
            Frame::Reply { .. } => Command::Reply,
            Frame::ReplyAckChunk { .. } => Command::ReplyAckChunk,
            Frame::ReplyException { .. } => Command::ReplyException,
            Frame::ReplyExceptionAbort { .. } => Command::ReplyExceptionAbort,
            Frame::StreamData { .. } => Command::StreamData,
            Frame::StreamClose { .. } => Command::StreamClose,
            Frame::StreamException { .. } => Command::StreamException,
            Frame::StreamAck { .. } => Command::StreamAck,
            Frame::StreamAsyncStart { .. } => Command::StreamAsyncStart,
            Frame::StreamAsyncClose { .. } => Command::StreamAsyncClose,
            Frame::StreamAsyncException { .. } => Command::StreamAsyncException,
        }
    }

    /// Encodes the frame body (command byte onward) into `buf`. The caller
    /// is responsible for the length prefix.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.command() as u8);
        match self {
            Frame::Alive => {}
            Frame::ServiceRequest {
                id,
                service_type,
                group_name,
                options,
            } => {
                buf.put_u32(*id);
                encode_cstring(buf, service_type);
                encode_cstring(buf, group_name);
                buf.put_slice(options);
            }
            Frame::ServiceNotFound { id }
            | Frame::ServiceError { id }
            | Frame::ServiceClientOpened { id }
            | Frame::ChannelClose { id }
            | Frame::ClientAsyncClose { id } => buf.put_u32(*id),
            Frame::Request {
                rid,
                flags,
                client_id,
                payload,
            } => {
                buf.put_u32(*rid);
                buf.put_u8(*flags);
                if let Some(cid) = client_id {
                    buf.put_u32(*cid);
                }
                buf.put_slice(payload);
            }
            Frame::Reply { rid, flags, payload } | Frame::ReplyException { rid, flags, payload } => {
                buf.put_u32(*rid);
                buf.put_u8(*flags);
                buf.put_slice(payload);
            }
            Frame::RequestAbort { rid }
            | Frame::RequestAckChunk { rid }
            | Frame::ReplyAckChunk { rid }
            | Frame::ReplyExceptionAbort { rid } => buf.put_u32(*rid),
            Frame::StreamData { sid, payload } => {
                buf.put_u32(*sid);
                buf.put_slice(payload);
            }
            Frame::StreamClose { sid }
            | Frame::StreamException { sid }
            | Frame::StreamAck { sid }
            | Frame::StreamAsyncStart { sid }
            | Frame::StreamAsyncClose { sid }
            | Frame::StreamAsyncException { sid } => buf.put_u32(*sid),
        }
    }

    /// Convenience for tests and the connection layer: the full body as bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Reserved flag bits must be zero
fn check_flags(flags: u8) -> Result<u8, CodecError> {
    if flags & !MSG_FLAG_FIRST != 0 {
        return Err(CodecError::ReservedFlags(flags));
    }
    Ok(flags)
}

impl fmt::Display for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Frame::Alive => write!(fmt, "Alive"),
            Frame::ServiceRequest {
                id, service_type, ..
            } => write!(fmt, "ServiceRequest id={id} type={service_type}"),
            Frame::ServiceNotFound { id } => write!(fmt, "ServiceNotFound id={id}"),
            Frame::ServiceError { id } => write!(fmt, "ServiceError id={id}"),
            Frame::ServiceClientOpened { id } => write!(fmt, "ServiceClientOpened id={id}"),
            Frame::ChannelClose { id } => write!(fmt, "ChannelClose id={id}"),
            Frame::ClientAsyncClose { id } => write!(fmt, "ClientAsyncClose id={id}"),
            Frame::Request { rid, flags, payload, .. } => {
                write!(fmt, "Request rid={rid} flags={flags:#04x} len={}", payload.len())
            }
            Frame::RequestAbort { rid } => write!(fmt, "RequestAbort rid={rid}"),
            Frame::RequestAckChunk { rid } => write!(fmt, "RequestAckChunk rid={rid}"),
            Frame::Reply { rid, flags, payload } => {
                write!(fmt, "Reply rid={rid} flags={flags:#04x} len={}", payload.len())
            }
            Frame::ReplyAckChunk { rid } => write!(fmt, "ReplyAckChunk rid={rid}"),
            Frame::ReplyException { rid, flags, payload } => write!(
                fmt,
                "ReplyException rid={rid} flags={flags:#04x} len={}",
                payload.len()
            ),
            Frame::ReplyExceptionAbort { rid } => write!(fmt, "ReplyExceptionAbort rid={rid}"),
            Frame::StreamData { sid, payload } => {
                write!(fmt, "StreamData sid={sid} len={}", payload.len())
            }
            Frame::StreamClose { sid } => write!(fmt, "StreamClose sid={sid}"),
            Frame::StreamException { sid } => write!(fmt, "StreamException sid={sid}"),
            Frame::StreamAck { sid } => write!(fmt, "StreamAck sid={sid}"),
            Frame::StreamAsyncStart { sid } => write!(fmt, "StreamAsyncStart sid={sid}"),
            Frame::StreamAsyncClose { sid } => write!(fmt, "StreamAsyncClose sid={sid}"),
            Frame::StreamAsyncException { sid } => write!(fmt, "StreamAsyncException sid={sid}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(parts: &[&[u8]]) -> Bytes {
        let mut buf = BytesMut::new();
        for p in parts {
            buf.put_slice(p);
        }
        buf.freeze()
    }

    #[test]
    fn check_requires_full_frame() {
        // Prefix claims 5 bytes, only 4 present
        let data: &[u8] = &[0x00, 0x00, 0x00, 0x05, 0x01, 0x02, 0x03, 0x04];
        let mut buf = Cursor::new(data);
        assert!(matches!(Frame::check(&mut buf), Err(CodecError::Incomplete)));

        let data: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x01];
        let mut buf = Cursor::new(data);
        assert_eq!(Frame::check(&mut buf).unwrap(), 1);
    }

    #[test]
    fn check_rejects_zero_and_oversized_lengths() {
        let data: &[u8] = &[0x00, 0x00, 0x00, 0x00];
        let mut buf = Cursor::new(data);
        assert!(matches!(
            Frame::check(&mut buf),
            Err(CodecError::InvalidFrameLength { length: 0, .. })
        ));

        let data: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF];
        let mut buf = Cursor::new(data);
        assert!(matches!(
            Frame::check(&mut buf),
            Err(CodecError::InvalidFrameLength { .. })
        ));
    }

    #[test]
    fn parse_service_request() {
        let data = body(&[
            &[0x10], // command
            &0x00000007u32.to_be_bytes(),
            b"foo\0",
            b"grp\0",
            &[0x00], // empty option map
        ]);

        let frame = Frame::parse(&data).unwrap();
        if let Frame::ServiceRequest {
            id,
            service_type,
            group_name,
            options,
        } = frame
        {
            assert_eq!(id, 7);
            assert_eq!(service_type, "foo");
            assert_eq!(group_name, "grp");
            assert_eq!(options.as_ref(), &[0x00]);
        } else {
            panic!("Unexpected frame variant");
        }
    }

    #[test]
    fn parse_request_first_carries_client_id() {
        let data = body(&[
            &[0x20],
            &0x00000010u32.to_be_bytes(),
            &[MSG_FLAG_FIRST],
            &0x00000007u32.to_be_bytes(),
            b"AB",
        ]);

        let frame = Frame::parse(&data).unwrap();
        if let Frame::Request {
            rid,
            flags,
            client_id,
            payload,
        } = frame
        {
            assert_eq!(rid, 0x10);
            assert_eq!(flags, MSG_FLAG_FIRST);
            assert_eq!(client_id, Some(7));
            assert_eq!(payload.as_ref(), b"AB");
        } else {
            panic!("Unexpected frame variant");
        }
    }

    #[test]
    fn parse_request_subsequent_has_no_client_id() {
        let data = body(&[&[0x20], &0x00000010u32.to_be_bytes(), &[0x00], b"CD"]);

        let frame = Frame::parse(&data).unwrap();
        if let Frame::Request {
            client_id, payload, ..
        } = frame
        {
            assert_eq!(client_id, None);
            assert_eq!(payload.as_ref(), b"CD");
        } else {
            panic!("Unexpected frame variant");
        }
    }

    #[test]
    fn parse_reserved_flag_bits_rejected() {
        let data = body(&[&[0x30], &0x00000020u32.to_be_bytes(), &[0x82], b"X"]);

        assert!(matches!(
            Frame::parse(&data),
            Err(CodecError::ReservedFlags(0x82))
        ));
    }

    #[test]
    fn parse_invalid_command() {
        let data = body(&[&[0xFF], &[0x01, 0x02]]);

        assert!(matches!(
            Frame::parse(&data),
            Err(CodecError::InvalidCommand(0xFF))
        ));
    }

    #[test]
    fn parse_truncated_header() {
        let data = body(&[&[0x21], &[0x00, 0x01]]);

        assert!(matches!(Frame::parse(&data), Err(CodecError::Incomplete)));
    }

    #[test]
    fn encode_parse_roundtrip_reply() {
        let original = Frame::Reply {
            rid: 0x20,
            flags: MSG_FLAG_FIRST,
            payload: Bytes::from_static(b"XY"),
        };

        let encoded = original.to_bytes();
        let parsed = Frame::parse(&encoded).unwrap();

        if let Frame::Reply { rid, flags, payload } = parsed {
            assert_eq!(rid, 0x20);
            assert_eq!(flags, MSG_FLAG_FIRST);
            assert_eq!(payload.as_ref(), b"XY");
        } else {
            panic!("Unexpected frame variant");
        }
    }

    #[test]
    fn encode_alive_is_single_byte() {
        assert_eq!(Frame::Alive.to_bytes().as_ref(), &[0x01]);
    }

    #[test]
    fn parse_stream_data() {
        let data = body(&[&[0x40], &0xDEADBEEFu32.to_be_bytes(), b"chunk"]);

        let frame = Frame::parse(&data).unwrap();
        if let Frame::StreamData { sid, payload } = frame {
            assert_eq!(sid, 0xDEADBEEF);
            assert_eq!(payload.as_ref(), b"chunk");
        } else {
            panic!("Unexpected frame variant");
        }
    }
}
