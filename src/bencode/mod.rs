//! Bencode codec
//!
//! Decodes and encodes the self-describing format used by torrent files and
//! HTTP tracker replies.

pub mod decoder;
pub mod encoder;
pub mod value;

pub use decoder::{decode, decode_exact, Decoder, MAX_DEPTH, MAX_DIGITS};
pub use encoder::{encode, encode_into};
pub use value::{lookup, BencodeNode, BencodeValue};
