//! Bencode encoder
//!
//! Writes dictionary entries in their stored order. Encoding a decoded tree
//! is not guaranteed to reproduce the source bytes (the decoder accepts
//! leading zeros), so info-hashes are always taken from the raw source span.

use bytes::{BufMut, BytesMut};

use super::value::BencodeValue;

/// Encode a value to a fresh buffer
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf);
    buf.to_vec()
}

pub fn encode_into(value: &BencodeValue, buf: &mut BytesMut) {
    match value {
        BencodeValue::Integer(i) => {
            buf.put_u8(b'i');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        BencodeValue::ByteString(bytes) => put_string(bytes, buf),
        BencodeValue::List(items) => {
            buf.put_u8(b'l');
            for item in items {
                encode_into(&item.value, buf);
            }
            buf.put_u8(b'e');
        }
        BencodeValue::Dict(entries) => {
            buf.put_u8(b'd');
            for (key, item) in entries {
                put_string(key, buf);
                encode_into(&item.value, buf);
            }
            buf.put_u8(b'e');
        }
    }
}

fn put_string(bytes: &[u8], buf: &mut BytesMut) {
    buf.put_slice(bytes.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(bytes);
}
