//! Torrent file handling
//!
//! Turns a decoded torrent document into the announce URL, info-hash and
//! piece table the rest of the client works with.

pub mod metainfo;

pub use metainfo::{Metainfo, TorrentFile};
