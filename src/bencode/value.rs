//! Bencode data model
//!
//! A decoded document is a tree of `BencodeNode`s. Each node owns its
//! children and remembers the byte range of the source it came from, so
//! callers can re-slice the original bytes of any sub-document.

use std::ops::Range;

use bytes::Bytes;

/// One decoded value plus the `[start, end)` range it occupied in the source.
///
/// Equality compares content only. Two trees decoded from differently
/// laid out sources, or built by hand, are equal when their values are.
#[derive(Debug, Clone)]
pub struct BencodeNode {
    pub value: BencodeValue,
    pub start: usize,
    pub end: usize,
}

/// The four bencode productions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    /// Arbitrary binary content, not necessarily UTF-8
    ByteString(Bytes),
    List(Vec<BencodeNode>),
    /// Entries in the order they were encountered. Duplicate keys are kept.
    Dict(Vec<(Bytes, BencodeNode)>),
}

impl PartialEq for BencodeNode {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for BencodeNode {}

impl BencodeNode {
    pub fn new(value: BencodeValue, span: Range<usize>) -> Self {
        Self {
            value,
            start: span.start,
            end: span.end,
        }
    }

    /// Wrap a hand-built value that was never decoded from a source
    pub fn detached(value: BencodeValue) -> Self {
        Self::new(value, 0..0)
    }

    pub fn span(&self) -> Range<usize> {
        self.start..self.end
    }

    /// The exact bytes of `source` this node was decoded from.
    ///
    /// `source` must be the buffer passed to the decoder. Returns `None` if
    /// the span does not fit inside it.
    pub fn raw_bytes<'a>(&self, source: &'a [u8]) -> Option<&'a [u8]> {
        source.get(self.span())
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&BencodeNode> {
        self.value.lookup(key)
    }

    pub fn as_int(&self) -> Option<i64> {
        self.value.as_int()
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        self.value.as_bytes()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    pub fn as_list(&self) -> Option<&[BencodeNode]> {
        self.value.as_list()
    }

    pub fn as_dict(&self) -> Option<&[(Bytes, BencodeNode)]> {
        self.value.as_dict()
    }
}

impl From<BencodeValue> for BencodeNode {
    fn from(value: BencodeValue) -> Self {
        BencodeNode::detached(value)
    }
}

impl BencodeValue {
    pub fn int(value: i64) -> Self {
        BencodeValue::Integer(value)
    }

    pub fn bytes(value: impl AsRef<[u8]>) -> Self {
        BencodeValue::ByteString(Bytes::copy_from_slice(value.as_ref()))
    }

    pub fn list(items: impl IntoIterator<Item = BencodeValue>) -> Self {
        BencodeValue::List(items.into_iter().map(BencodeNode::detached).collect())
    }

    /// Build a dictionary keeping the given entry order
    pub fn dict<K: AsRef<[u8]>>(entries: impl IntoIterator<Item = (K, BencodeValue)>) -> Self {
        BencodeValue::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (Bytes::copy_from_slice(k.as_ref()), BencodeNode::detached(v)))
                .collect(),
        )
    }

    /// Dictionary lookup by exact byte equality.
    ///
    /// Linear scan: when a key appears more than once the first occurrence
    /// wins. Returns `None` for non-dictionaries and absent keys.
    pub fn lookup(&self, key: &[u8]) -> Option<&BencodeNode> {
        match self {
            BencodeValue::Dict(entries) => entries
                .iter()
                .find(|(k, _)| k.as_ref() == key)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            BencodeValue::ByteString(b) => Some(b),
            _ => None,
        }
    }

    /// Byte string content if it is valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[BencodeNode]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Bytes, BencodeNode)]> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Short name of the production, for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            BencodeValue::Integer(_) => "integer",
            BencodeValue::ByteString(_) => "byte string",
            BencodeValue::List(_) => "list",
            BencodeValue::Dict(_) => "dictionary",
        }
    }
}

/// Free-function form of [`BencodeValue::lookup`]
pub fn lookup<'a>(dict: &'a BencodeNode, key: &[u8]) -> Option<&'a BencodeNode> {
    dict.lookup(key)
}
