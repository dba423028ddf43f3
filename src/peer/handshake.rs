//! Peer handshake
//!
//! The fixed 68-byte greeting both sides exchange before any message.

use bytes::{BufMut, BytesMut};
use tracing::{debug, info, trace, warn};

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Length byte preceding the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total handshake size: 1 + 19 + 8 + 20 + 20
pub const HANDSHAKE_LEN: usize = 68;

/// Client prefix of generated peer IDs (Azureus style)
pub const PEER_ID_PREFIX: &[u8; 8] = b"-BF0001-";

/// One side's handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved extension bytes. We always send zeros.
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        debug!("Creating handshake for info_hash: {}", hex::encode(info_hash));
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serialize to the 68-byte wire form
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        trace!("Handshake serialized: {} bytes", buf.len());
        buf.to_vec()
    }

    /// Parse a received handshake. Returns `None` when the length byte or
    /// protocol string is not BitTorrent's.
    pub fn deserialize(data: &[u8; HANDSHAKE_LEN]) -> Option<Self> {
        if data[0] != PROTOCOL_LENGTH || &data[1..20] != PROTOCOL_STRING {
            warn!("Handshake carries an unknown protocol header");
            return None;
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        trace!(
            "Handshake info_hash {}, peer_id {}",
            hex::encode(info_hash),
            hex::encode(peer_id)
        );
        Some(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// True when the remote side is talking about the same torrent
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if self.info_hash != *expected_info_hash {
            warn!("Handshake validation failed: info hash mismatch");
            warn!("  Expected: {}", hex::encode(expected_info_hash));
            warn!("  Got:      {}", hex::encode(self.info_hash));
            return false;
        }
        true
    }
}

/// Random peer ID: the client prefix followed by 12 random bytes
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
    info!("Generated peer ID: {}", hex::encode(peer_id));
    peer_id
}
