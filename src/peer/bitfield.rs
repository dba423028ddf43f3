//! Piece availability advertised by a peer

use bytes::Bytes;

use super::message::MAX_BLOCK_LEN;

/// Most pieces tracked before a peer has sent a BITFIELD: as many bits as
/// the largest frame we accept could carry
pub const MAX_TRACKED_PIECES: usize = MAX_BLOCK_LEN * 8;

/// Bit `i` set means the peer has piece `i`. Bit 0 is the high bit of
/// the first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    /// Indices at or past this are never stored
    limit: usize,
}

impl Default for Bitfield {
    fn default() -> Self {
        Self {
            bits: Vec::new(),
            limit: MAX_TRACKED_PIECES,
        }
    }
}

impl Bitfield {
    /// Empty field holding exactly `num_pieces`
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: vec![0u8; num_pieces.div_ceil(8)],
            limit: num_pieces,
        }
    }

    /// Field as advertised in a BITFIELD message. Its length fixes the
    /// range later HAVEs may touch.
    pub fn from_bytes(bytes: &Bytes) -> Self {
        Self {
            bits: bytes.to_vec(),
            limit: bytes.len() * 8,
        }
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.bits
            .get(index / 8)
            .is_some_and(|byte| byte & (0x80 >> (index % 8)) != 0)
    }

    /// Set a piece bit, growing the field up to its limit. Returns false
    /// and leaves the field untouched when `index` is out of range.
    pub fn set_piece(&mut self, index: usize) -> bool {
        if index >= self.limit {
            return false;
        }
        let byte = index / 8;
        if byte >= self.bits.len() {
            self.bits.resize(byte + 1, 0);
        }
        self.bits[byte] |= 0x80 >> (index % 8);
        true
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}
