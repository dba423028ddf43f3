//! Bencode decoder
//!
//! Cursor-based recursive descent over a byte slice. Every node records the
//! span it was decoded from. The first structural error aborts the whole
//! document; no partial tree is ever returned.

use bytes::Bytes;
use tracing::trace;

use super::value::{BencodeNode, BencodeValue};
use crate::error::DecodeError;

/// Longest digit run accepted for integers and string lengths
pub const MAX_DIGITS: usize = 18;

/// Deepest container nesting accepted
pub const MAX_DEPTH: usize = 64;

/// Decode one value from the start of `data`.
///
/// Trailing bytes after the first value are not an error here; use
/// [`decode_exact`] when the input must be a single document.
pub fn decode(data: &[u8]) -> Result<BencodeNode, DecodeError> {
    Decoder::new(data).decode_next()
}

/// Decode `data` as exactly one document, rejecting trailing bytes
pub fn decode_exact(data: &[u8]) -> Result<BencodeNode, DecodeError> {
    let mut decoder = Decoder::new(data);
    let node = decoder.decode_next()?;
    if !decoder.is_at_end() {
        return Err(DecodeError::TrailingData {
            offset: decoder.position(),
        });
    }
    Ok(node)
}

/// Streaming cursor over an in-memory bencoded buffer
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Offset of the next unread byte
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Unconsumed input
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }

    /// Decode exactly one value and leave the cursor just past it
    pub fn decode_next(&mut self) -> Result<BencodeNode, DecodeError> {
        let node = self.decode_value(0)?;
        trace!(
            "Decoded {} spanning {}..{}",
            node.value.kind(),
            node.start,
            node.end
        );
        Ok(node)
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn decode_value(&mut self, depth: usize) -> Result<BencodeNode, DecodeError> {
        let start = self.pos;
        let byte = self.peek().ok_or(DecodeError::UnexpectedEof {
            offset: start,
            context: "a value",
        })?;

        let value = match byte {
            b'i' => {
                self.pos += 1;
                self.decode_integer()?
            }
            b'l' => {
                self.check_depth(depth)?;
                self.pos += 1;
                self.decode_list(depth)?
            }
            b'd' => {
                self.check_depth(depth)?;
                self.pos += 1;
                self.decode_dict(depth)?
            }
            b'0'..=b'9' => BencodeValue::ByteString(self.decode_string()?),
            other => {
                return Err(DecodeError::UnexpectedByte {
                    offset: start,
                    byte: other,
                    expected: "a value ('i', 'l', 'd' or a digit)",
                })
            }
        };

        Ok(BencodeNode::new(value, start..self.pos))
    }

    fn check_depth(&self, depth: usize) -> Result<(), DecodeError> {
        if depth >= MAX_DEPTH {
            return Err(DecodeError::NestingTooDeep {
                offset: self.pos,
                max: MAX_DEPTH,
            });
        }
        Ok(())
    }

    fn decode_integer(&mut self) -> Result<BencodeValue, DecodeError> {
        let negative = self.peek() == Some(b'-');
        if negative {
            self.pos += 1;
        }
        let magnitude = self.read_digits()?;
        self.expect(b'e', "integer terminator 'e'")?;
        // 18 digits always fit in an i64
        let value = magnitude as i64;
        Ok(BencodeValue::Integer(if negative { -value } else { value }))
    }

    fn decode_string(&mut self) -> Result<Bytes, DecodeError> {
        let declared = self.read_digits()?;
        self.expect(b':', "':' after string length")?;

        let available = self.data.len() - self.pos;
        let length = usize::try_from(declared)
            .ok()
            .filter(|len| *len <= available)
            .ok_or(DecodeError::ShortString {
                offset: self.pos,
                declared,
                available,
            })?;

        let bytes = Bytes::copy_from_slice(&self.data[self.pos..self.pos + length]);
        self.pos += length;
        Ok(bytes)
    }

    fn decode_list(&mut self, depth: usize) -> Result<BencodeValue, DecodeError> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(DecodeError::UnexpectedEof {
                        offset: self.pos,
                        context: "a list",
                    })
                }
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(BencodeValue::List(items));
                }
                Some(_) => items.push(self.decode_value(depth + 1)?),
            }
        }
    }

    fn decode_dict(&mut self, depth: usize) -> Result<BencodeValue, DecodeError> {
        let mut entries = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(DecodeError::UnexpectedEof {
                        offset: self.pos,
                        context: "a dictionary",
                    })
                }
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(BencodeValue::Dict(entries));
                }
                Some(b'0'..=b'9') => {
                    let key = self.decode_string()?;
                    let value = self.decode_value(depth + 1)?;
                    entries.push((key, value));
                }
                Some(other) => {
                    return Err(DecodeError::InvalidDictKey {
                        offset: self.pos,
                        byte: other,
                    })
                }
            }
        }
    }

    /// Read a non-empty run of at most `MAX_DIGITS` ASCII digits.
    /// Leading zeros are accepted as-is.
    fn read_digits(&mut self) -> Result<u64, DecodeError> {
        let mut value: u64 = 0;
        let mut count = 0;
        while let Some(byte) = self.peek().filter(u8::is_ascii_digit) {
            if count == MAX_DIGITS {
                return Err(DecodeError::TooManyDigits {
                    offset: self.pos,
                    max: MAX_DIGITS,
                });
            }
            value = value * 10 + u64::from(byte - b'0');
            count += 1;
            self.pos += 1;
        }
        if count == 0 {
            return Err(DecodeError::EmptyNumber { offset: self.pos });
        }
        Ok(value)
    }

    fn expect(&mut self, wanted: u8, expected: &'static str) -> Result<(), DecodeError> {
        match self.peek() {
            Some(byte) if byte == wanted => {
                self.pos += 1;
                Ok(())
            }
            Some(byte) => Err(DecodeError::UnexpectedByte {
                offset: self.pos,
                byte,
                expected,
            }),
            None => Err(DecodeError::UnexpectedEof {
                offset: self.pos,
                context: expected,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_integers() {
        assert_eq!(decode(b"i42e").unwrap().as_int(), Some(42));
        assert_eq!(decode(b"i-42e").unwrap().as_int(), Some(-42));
        assert_eq!(decode(b"i0e").unwrap().as_int(), Some(0));
    }

    #[test]
    fn test_decode_integer_accepts_leading_zeros() {
        assert_eq!(decode(b"i007e").unwrap().as_int(), Some(7));
        assert_eq!(decode(b"i-0e").unwrap().as_int(), Some(0));
    }

    #[test]
    fn test_decode_empty_integers_fail() {
        assert!(matches!(
            decode(b"i-e"),
            Err(DecodeError::EmptyNumber { offset: 2 })
        ));
        assert!(matches!(
            decode(b"ie"),
            Err(DecodeError::EmptyNumber { offset: 1 })
        ));
    }

    #[test]
    fn test_decode_integer_digit_limit() {
        let max = format!("i{}e", "9".repeat(MAX_DIGITS));
        assert_eq!(
            decode(max.as_bytes()).unwrap().as_int(),
            Some(999_999_999_999_999_999)
        );

        let too_long = format!("i{}e", "1".repeat(MAX_DIGITS + 1));
        assert!(matches!(
            decode(too_long.as_bytes()),
            Err(DecodeError::TooManyDigits { offset: 19, .. })
        ));
    }

    #[test]
    fn test_decode_unterminated_integer() {
        assert!(matches!(
            decode(b"i42"),
            Err(DecodeError::UnexpectedEof { offset: 3, .. })
        ));
        assert!(matches!(
            decode(b"i4x2e"),
            Err(DecodeError::UnexpectedByte { byte: b'x', offset: 2, .. })
        ));
    }

    #[test]
    fn test_decode_strings_of_various_lengths() {
        for n in [0usize, 1, 1024] {
            let content: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
            let mut doc = format!("{}:", n).into_bytes();
            doc.extend_from_slice(&content);

            let node = decode(&doc).unwrap();
            assert_eq!(node.as_bytes().map(|b| b.as_ref()), Some(content.as_slice()));
            assert_eq!(node.span(), 0..doc.len());
        }
    }

    #[test]
    fn test_decode_binary_string() {
        let node = decode(b"3:\x00\xff\x80").unwrap();
        assert_eq!(node.as_bytes().unwrap().as_ref(), &[0x00, 0xff, 0x80]);
    }

    #[test]
    fn test_decode_short_string_fails() {
        assert!(matches!(
            decode(b"10:abc"),
            Err(DecodeError::ShortString {
                offset: 3,
                declared: 10,
                available: 3
            })
        ));
    }

    #[test]
    fn test_decode_string_missing_colon() {
        assert!(matches!(
            decode(b"4spam"),
            Err(DecodeError::UnexpectedByte { byte: b's', offset: 1, .. })
        ));
    }

    #[test]
    fn test_decode_lists() {
        let empty = decode(b"le").unwrap();
        assert_eq!(empty.as_list().map(|l| l.len()), Some(0));

        let list = decode(b"l4:spam4:eggse").unwrap();
        let items: Vec<&str> = list
            .as_list()
            .unwrap()
            .iter()
            .filter_map(|n| n.as_str())
            .collect();
        assert_eq!(items, vec!["spam", "eggs"]);
        assert_eq!(list.as_list().unwrap()[1].span(), 7..13);
    }

    #[test]
    fn test_decode_dict() {
        let dict = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        assert_eq!(dict.as_dict().map(|d| d.len()), Some(2));
        assert_eq!(dict.lookup(b"cow").and_then(|n| n.as_str()), Some("moo"));
        assert_eq!(dict.lookup(b"spam").and_then(|n| n.as_str()), Some("eggs"));
    }

    #[test]
    fn test_decode_dict_keeps_duplicates() {
        let dict = decode(b"d1:ai1e1:ai2ee").unwrap();
        assert_eq!(dict.as_dict().map(|d| d.len()), Some(2));
        assert_eq!(dict.lookup(b"a").and_then(|n| n.as_int()), Some(1));
    }

    #[test]
    fn test_decode_dict_rejects_non_string_key() {
        assert!(matches!(
            decode(b"di1ei2ee"),
            Err(DecodeError::InvalidDictKey { byte: b'i', offset: 1 })
        ));
    }

    #[test]
    fn test_unterminated_collections_fail() {
        assert!(matches!(
            decode(b"l4:spam"),
            Err(DecodeError::UnexpectedEof { offset: 7, .. })
        ));
        assert!(matches!(
            decode(b"l4:spa"),
            Err(DecodeError::ShortString { .. })
        ));
        assert!(matches!(
            decode(b"d3:cow3:moo"),
            Err(DecodeError::UnexpectedEof { .. })
        ));
        assert!(matches!(
            decode(b"d3:cowe"),
            Err(DecodeError::UnexpectedByte { byte: b'e', .. })
        ));
    }

    #[test]
    fn test_unknown_leading_byte() {
        let err = decode(b"x").unwrap_err();
        assert_eq!(err.offset(), 0);
        assert!(matches!(err, DecodeError::UnexpectedByte { byte: b'x', .. }));
        assert!(matches!(decode(b""), Err(DecodeError::UnexpectedEof { offset: 0, .. })));
    }

    #[test]
    fn test_nesting_limit() {
        let mut deep = "l".repeat(MAX_DEPTH + 1);
        deep.push_str(&"e".repeat(MAX_DEPTH + 1));
        assert!(matches!(
            decode(deep.as_bytes()),
            Err(DecodeError::NestingTooDeep { .. })
        ));

        let mut ok = "l".repeat(MAX_DEPTH);
        ok.push_str(&"e".repeat(MAX_DEPTH));
        assert!(decode(ok.as_bytes()).is_ok());
    }

    #[test]
    fn test_sub_dictionary_span_reslices_source() {
        let source = b"d8:announce9:udp://x:14:infod6:lengthi10e4:name3:abc12:piece lengthi4eee";
        let root = decode(source).unwrap();
        let info = root.lookup(b"info").unwrap();
        assert_eq!(
            info.raw_bytes(source).unwrap(),
            b"d6:lengthi10e4:name3:abc12:piece lengthi4ee"
        );
        assert_eq!(root.span(), 0..source.len());
    }

    #[test]
    fn test_child_spans_nest_inside_parent() {
        let source = b"d1:ald1:bi1eee1:ci-3ee";
        let root = decode(source).unwrap();
        for (_, child) in root.as_dict().unwrap() {
            assert!(child.start > root.start && child.end < root.end);
        }
        let list = root.lookup(b"a").unwrap();
        let inner = &list.as_list().unwrap()[0];
        assert!(inner.start > list.start && inner.end < list.end);
        assert_eq!(inner.raw_bytes(source).unwrap(), b"d1:bi1ee");
    }

    #[test]
    fn test_decoder_leaves_cursor_after_value() {
        let mut decoder = Decoder::new(b"i1e4:spamxyz");
        assert_eq!(decoder.decode_next().unwrap().as_int(), Some(1));
        assert_eq!(decoder.position(), 3);
        assert_eq!(decoder.decode_next().unwrap().as_str(), Some("spam"));
        assert_eq!(decoder.remaining(), b"xyz");
    }

    #[test]
    fn test_decode_exact_rejects_trailing_data() {
        assert!(decode(b"i1ei2e").is_ok());
        assert_eq!(
            decode_exact(b"i1ei2e"),
            Err(DecodeError::TrailingData { offset: 3 })
        );
    }
}
