//! Error types for the client
//!
//! Each component fails fast with its own error type. `ClientError` wraps
//! all of them for callers that drive the whole pipeline.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Malformed bencoded input. Every variant carries the stream offset at
/// which decoding stopped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input at offset {offset} while parsing {context}")]
    UnexpectedEof { offset: usize, context: &'static str },

    #[error("unexpected byte '{}' (0x{byte:02X}) at offset {offset}, expected {expected}", printable(.byte))]
    UnexpectedByte {
        offset: usize,
        byte: u8,
        expected: &'static str,
    },

    #[error("expected a number at offset {offset}")]
    EmptyNumber { offset: usize },

    #[error("number at offset {offset} exceeds {max} digits")]
    TooManyDigits { offset: usize, max: usize },

    #[error("string at offset {offset} declares {declared} bytes but only {available} remain")]
    ShortString {
        offset: usize,
        declared: u64,
        available: usize,
    },

    #[error("dictionary key at offset {offset} must be a byte string, found '{}' (0x{byte:02X})", printable(.byte))]
    InvalidDictKey { offset: usize, byte: u8 },

    #[error("nesting deeper than {max} levels at offset {offset}")]
    NestingTooDeep { offset: usize, max: usize },

    #[error("trailing data at offset {offset}")]
    TrailingData { offset: usize },
}

fn printable(byte: &u8) -> char {
    if byte.is_ascii_graphic() {
        char::from(*byte)
    } else {
        '?'
    }
}

impl DecodeError {
    /// Byte offset in the source stream where the error occurred
    pub fn offset(&self) -> usize {
        match self {
            DecodeError::UnexpectedEof { offset, .. }
            | DecodeError::UnexpectedByte { offset, .. }
            | DecodeError::EmptyNumber { offset }
            | DecodeError::TooManyDigits { offset, .. }
            | DecodeError::ShortString { offset, .. }
            | DecodeError::InvalidDictKey { offset, .. }
            | DecodeError::NestingTooDeep { offset, .. }
            | DecodeError::TrailingData { offset } => *offset,
        }
    }
}

/// Failures while turning an announce URL into a peer list
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid announce url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported announce scheme `{0}`")]
    UnsupportedScheme(String),

    #[error("failed to resolve tracker host `{host}`: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tracker host `{0}` resolved to no IPv4 address")]
    NoAddress(String),

    #[error("socket error talking to tracker {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tracker {addr} did not answer within {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("transaction id mismatch: sent {expected:#010x}, received {actual:#010x}")]
    TransactionMismatch { expected: u32, actual: u32 },

    #[error("unexpected action in tracker reply: expected {expected}, received {actual}")]
    ActionMismatch { expected: u32, actual: u32 },

    #[error("tracker reply too short: expected at least {expected} bytes, received {actual}")]
    ShortResponse { expected: usize, actual: usize },

    #[error("peer data is {actual} bytes, expected {expected} for the declared peer count")]
    PeerCountMismatch { expected: usize, actual: usize },

    #[error("compact peer list length {0} is not a multiple of 6")]
    InvalidCompactPeers(usize),

    #[error("tracker returned failure: {0}")]
    TrackerFailure(String),

    #[error("malformed http response: {0}")]
    MalformedHttp(String),

    #[error("http tracker response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("tracker response body is not valid bencode: {0}")]
    Decode(#[from] DecodeError),

    #[error("tracker response is missing a byte-string `peers` key")]
    MissingPeers,

    #[cfg(feature = "https")]
    #[error("https tracker request failed: {0}")]
    Https(#[from] reqwest::Error),
}

/// Failures reading one length-prefixed peer message
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("frame declares {length} bytes, limit is {max}")]
    TooLarge { length: usize, max: usize },

    #[error("connection closed after {received} of {expected} payload bytes")]
    Truncated { expected: usize, received: usize },

    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

/// Failures while establishing a peer session
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to connect to peer {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {timeout:?} while {stage} with peer {addr}")]
    Timeout {
        addr: SocketAddr,
        stage: &'static str,
        timeout: Duration,
    },

    #[error("i/o error while {stage} with peer {addr}: {source}")]
    Io {
        addr: SocketAddr,
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("peer {addr} sent a short handshake: expected 68 bytes, received {received}")]
    ShortHandshake { addr: SocketAddr, received: usize },

    #[error("peer {addr} sent an invalid protocol header")]
    InvalidProtocol { addr: SocketAddr },

    #[error("info hash mismatch with peer {addr}: expected {expected}, received {actual}")]
    InfoHashMismatch {
        addr: SocketAddr,
        expected: String,
        actual: String,
    },

    #[error("peer {addr} sent a malformed message: {reason}")]
    Protocol { addr: SocketAddr, reason: String },
}

/// Failures while fetching blocks from an unchoked session
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("session with {addr} is not unchoked")]
    NotUnchoked { addr: SocketAddr },

    #[error("failed to send request to {addr}: {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read from {addr}: {source}")]
    Receive {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("peer {addr} sent a short block: expected {expected} bytes, received {received}")]
    ShortBlock {
        addr: SocketAddr,
        expected: usize,
        received: usize,
    },

    #[error("timed out after {timeout:?} waiting for block data from {addr}")]
    Timeout { addr: SocketAddr, timeout: Duration },

    #[error("peer {addr} choked us while a request was outstanding")]
    Choked { addr: SocketAddr },

    #[error("peer {addr} sent a malformed message: {reason}")]
    Protocol { addr: SocketAddr, reason: String },

    #[error("invalid block request: {0}")]
    InvalidRequest(String),

    #[error("piece {index} failed hash verification: expected {expected}, computed {actual}")]
    HashMismatch {
        index: u32,
        expected: String,
        actual: String,
    },
}

/// Any failure along the codec → tracker → peer → download path
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("invalid torrent metainfo: {0}")]
    Metainfo(String),
}
