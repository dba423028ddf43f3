//! bitfetch
//!
//! A minimal BitTorrent client core: bencode codec, UDP and HTTP tracker
//! clients, the peer wire protocol up to an unchoked session, and a
//! sequential piece downloader.

pub mod bencode;
pub mod cli;
pub mod download;
pub mod error;
pub mod peer;
pub mod torrent;
pub mod tracker;

pub use error::{ClientError, DecodeError, DownloadError, FrameError, HandshakeError, TrackerError};

pub use bencode::{decode, decode_exact, encode, lookup, BencodeNode, BencodeValue, Decoder};
pub use cli::{CliArgs, Config, PieceSelection};
pub use download::{download_piece, request_block, request_piece, verify_piece, DownloadConfig};
pub use peer::{generate_peer_id, Bitfield, Handshake, Message, MessageId, PeerSession, SessionConfig, SessionState};
pub use torrent::{Metainfo, TorrentFile};
pub use tracker::{
    connect_tracker, fetch_peers, parse_announce_url, parse_compact_peers, AnnounceRequest,
    PeerEndpoint, Tracker, TrackerConfig, TrackerTarget,
};
