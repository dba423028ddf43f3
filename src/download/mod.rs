//! Piece downloader
//!
//! Requests blocks from an unchoked session one at a time and assembles
//! them into pieces. Every read waits at most `block_timeout`.

use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::error::{DownloadError, FrameError};
use crate::peer::{Message, PeerSession, MAX_BLOCK_LEN};

/// Conventional block size
pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Bytes asked for per REQUEST
    pub block_size: u32,
    /// Bound on each frame read while a request is outstanding
    pub block_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            block_timeout: Duration::from_secs(30),
        }
    }
}

/// Fetch the first `block_size` bytes of a piece as a single block
pub async fn request_piece(
    session: &mut PeerSession,
    piece_index: u32,
    block_size: u32,
) -> Result<Vec<u8>, DownloadError> {
    let block_timeout = DownloadConfig::default().block_timeout;
    request_block(session, piece_index, 0, block_size, block_timeout).await
}

/// Send one REQUEST and wait for the matching PIECE.
///
/// Keep-alives and unrelated messages are skipped. A PIECE for some other
/// index or offset is logged and dropped. CHOKE ends the wait.
pub async fn request_block(
    session: &mut PeerSession,
    index: u32,
    begin: u32,
    length: u32,
    block_timeout: Duration,
) -> Result<Vec<u8>, DownloadError> {
    let addr = session.addr();
    if !session.is_unchoked() {
        return Err(DownloadError::NotUnchoked { addr });
    }
    if length == 0 || length as usize > MAX_BLOCK_LEN {
        return Err(DownloadError::InvalidRequest(format!(
            "block length {} outside 1..={}",
            length, MAX_BLOCK_LEN
        )));
    }

    let request = Message::Request {
        index,
        begin,
        length,
    };
    trace!("Requesting piece {} offset {} ({} bytes) from {}", index, begin, length, addr);
    if let Err(source) = session.send_message(&request).await {
        error!("Failed to send request to {}: {}", addr, source);
        session.reject();
        return Err(DownloadError::Send { addr, source });
    }

    loop {
        let message = match timeout(block_timeout, session.next_message()).await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                session.reject();
                return Err(frame_error(addr, length as usize, e));
            }
            Err(_) => {
                // the reply may still arrive mid-frame, so the stream is
                // no longer usable
                warn!("Timed out waiting for block from {}", addr);
                session.reject();
                return Err(DownloadError::Timeout {
                    addr,
                    timeout: block_timeout,
                });
            }
        };

        match message {
            Message::Piece {
                index: got_index,
                begin: got_begin,
                block,
            } => {
                if got_index != index || got_begin != begin {
                    warn!(
                        "Peer {} sent piece {} offset {}, expected {} offset {}; discarding",
                        addr, got_index, got_begin, index, begin
                    );
                    continue;
                }
                if block.len() != length as usize {
                    return Err(DownloadError::ShortBlock {
                        addr,
                        expected: length as usize,
                        received: block.len(),
                    });
                }
                trace!("Received block {}:{} ({} bytes) from {}", index, begin, block.len(), addr);
                return Ok(block.to_vec());
            }
            Message::Choke => return Err(DownloadError::Choked { addr }),
            _ => continue,
        }
    }
}

fn frame_error(addr: std::net::SocketAddr, expected: usize, err: FrameError) -> DownloadError {
    match err {
        FrameError::Io(source) => DownloadError::Receive { addr, source },
        FrameError::Truncated { received, .. } => DownloadError::ShortBlock {
            addr,
            expected,
            received,
        },
        other => DownloadError::Protocol {
            addr,
            reason: other.to_string(),
        },
    }
}

/// Download a whole piece of `piece_len` bytes in sequential blocks
pub async fn download_piece(
    session: &mut PeerSession,
    index: u32,
    piece_len: u64,
    config: &DownloadConfig,
) -> Result<Vec<u8>, DownloadError> {
    if config.block_size == 0 {
        return Err(DownloadError::InvalidRequest("block size must be positive".into()));
    }
    if piece_len > u32::MAX as u64 {
        return Err(DownloadError::InvalidRequest(format!(
            "piece length {} does not fit a block offset",
            piece_len
        )));
    }

    info!("Downloading piece {} ({} bytes) from {}", index, piece_len, session.addr());
    let mut data = Vec::with_capacity(piece_len as usize);
    let mut begin: u64 = 0;
    while begin < piece_len {
        let length = (piece_len - begin).min(config.block_size as u64) as u32;
        let block =
            request_block(session, index, begin as u32, length, config.block_timeout).await?;
        data.extend_from_slice(&block);
        begin += length as u64;
        debug!("Piece {}: {}/{} bytes", index, begin, piece_len);
    }
    Ok(data)
}

/// Check a piece against its SHA-1 from the metainfo
pub fn verify_piece(index: u32, data: &[u8], expected: &[u8; 20]) -> Result<(), DownloadError> {
    let actual: [u8; 20] = Sha1::digest(data).into();
    if actual != *expected {
        error!("Piece {} failed hash verification", index);
        return Err(DownloadError::HashMismatch {
            index,
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        });
    }
    debug!("Piece {} verified", index);
    Ok(())
}
