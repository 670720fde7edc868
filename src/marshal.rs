// ABOUTME: Marshalling seam for the service-open option map, with the default wire codec
// ABOUTME: Object marshalling for request/reply payloads stays with the registered handlers

use crate::codec::{decode_cstring, decode_u8, encode_cstring, CodecError};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::io::Cursor;

/// Options carried by a `SERVICE_REQUEST`.
pub type OptionMap = HashMap<String, String>;

/// Decodes and encodes the marshalled option map of the service-open
/// exchange. Decoding may fail with any [`CodecError`]; the dispatcher turns
/// that into a `SERVICE_ERROR` reply.
pub trait Marshaller: Send + Sync {
    fn read_option_map(&self, buf: &mut Cursor<&[u8]>) -> Result<OptionMap, CodecError>;

    fn write_option_map(&self, options: &OptionMap, buf: &mut BytesMut);
}

/// The crate's native option-map format: a pair count byte followed by
/// NUL-terminated key/value strings. An empty map is the single byte `0x00`.
/// Keys are written in sorted order so equal maps encode identically.
pub struct WireMarshaller;

impl Marshaller for WireMarshaller {
    fn read_option_map(&self, buf: &mut Cursor<&[u8]>) -> Result<OptionMap, CodecError> {
        let count = decode_u8(buf)?;
        let mut options = OptionMap::with_capacity(count as usize);
        for _ in 0..count {
            let key = decode_cstring(buf, "option_key")?;
            let value = decode_cstring(buf, "option_value")?;
            options.insert(key, value);
        }
        Ok(options)
    }

    fn write_option_map(&self, options: &OptionMap, buf: &mut BytesMut) {
        debug_assert!(options.len() <= u8::MAX as usize);
        buf.put_u8(options.len() as u8);

        let mut keys: Vec<&String> = options.keys().collect();
        keys.sort();
        for key in keys {
            encode_cstring(buf, key);
            encode_cstring(buf, &options[key]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_map_is_single_zero_byte() {
        let mut buf = BytesMut::new();
        WireMarshaller.write_option_map(&OptionMap::new(), &mut buf);
        assert_eq!(buf.as_ref(), &[0x00]);

        let mut cursor = Cursor::new(buf.as_ref() as &[u8]);
        let decoded = WireMarshaller.read_option_map(&mut cursor).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn option_map_roundtrip() {
        let mut options = OptionMap::new();
        options.insert("timeout".to_string(), "30".to_string());
        options.insert("mode".to_string(), "fast".to_string());

        let mut buf = BytesMut::new();
        WireMarshaller.write_option_map(&options, &mut buf);

        let frozen = buf.freeze();
        let mut cursor = Cursor::new(frozen.as_ref());
        let decoded = WireMarshaller.read_option_map(&mut cursor).unwrap();

        assert_eq!(decoded, options);
    }

    #[test]
    fn truncated_map_fails_to_decode() {
        // Claims one pair, carries no strings
        let data: &[u8] = &[0x01];
        let mut cursor = Cursor::new(data);

        assert!(WireMarshaller.read_option_map(&mut cursor).is_err());
    }
}
