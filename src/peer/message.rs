//! Peer wire messages
//!
//! Every message after the handshake is `u32 length | u8 id | payload`,
//! big-endian, where a zero length is a keep-alive with no id.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::FrameError;

/// Largest block a peer may send us
pub const MAX_BLOCK_LEN: usize = 1024 * 1024;

/// Largest frame accepted: one maximal PIECE (id + index + begin + data)
pub const MAX_FRAME_LEN: usize = MAX_BLOCK_LEN + 9;

/// Message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl MessageId {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageId::Choke),
            1 => Some(MessageId::Unchoke),
            2 => Some(MessageId::Interested),
            3 => Some(MessageId::NotInterested),
            4 => Some(MessageId::Have),
            5 => Some(MessageId::Bitfield),
            6 => Some(MessageId::Request),
            7 => Some(MessageId::Piece),
            8 => Some(MessageId::Cancel),
            _ => None,
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Bytes },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    /// Any id we do not interpret, payload kept verbatim
    Other { id: u8, payload: Bytes },
}

impl Message {
    /// Wire id, `None` for keep-alives
    pub fn id(&self) -> Option<u8> {
        let id = match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke as u8,
            Message::Unchoke => MessageId::Unchoke as u8,
            Message::Interested => MessageId::Interested as u8,
            Message::NotInterested => MessageId::NotInterested as u8,
            Message::Have { .. } => MessageId::Have as u8,
            Message::Bitfield { .. } => MessageId::Bitfield as u8,
            Message::Request { .. } => MessageId::Request as u8,
            Message::Piece { .. } => MessageId::Piece as u8,
            Message::Cancel { .. } => MessageId::Cancel as u8,
            Message::Other { id, .. } => *id,
        };
        Some(id)
    }

    /// Length prefix value: id plus payload
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Other { payload, .. } => 1 + payload.len() as u32,
        }
    }

    /// Serialize including the length prefix
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());
        if let Some(id) = self.id() {
            buf.put_u8(id);
        }

        match self {
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Other { payload, .. } => buf.put_slice(payload),
            _ => {}
        }

        trace!("Message serialized: {} bytes", buf.len());
        buf.to_vec()
    }

    /// Decode a frame body (id byte and payload, without the length prefix)
    pub fn parse(id: u8, mut payload: Bytes) -> Result<Self, FrameError> {
        let Some(known) = MessageId::from_u8(id) else {
            return Ok(Message::Other { id, payload });
        };

        let expect_len = |kind: &'static str, want: usize, payload: &Bytes| {
            if payload.len() == want {
                Ok(())
            } else {
                Err(FrameError::Malformed {
                    kind,
                    reason: format!("payload is {} bytes, expected {}", payload.len(), want),
                })
            }
        };

        let message = match known {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                expect_len("have", 4, &payload)?;
                Message::Have {
                    piece_index: payload.get_u32(),
                }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: payload },
            MessageId::Request | MessageId::Cancel => {
                expect_len("request", 12, &payload)?;
                let index = payload.get_u32();
                let begin = payload.get_u32();
                let length = payload.get_u32();
                if known == MessageId::Request {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(FrameError::Malformed {
                        kind: "piece",
                        reason: format!("payload is {} bytes, need at least 8", payload.len()),
                    });
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece {
                    index,
                    begin,
                    block: payload,
                }
            }
        };
        Ok(message)
    }
}

/// Read one whole frame.
///
/// The declared length is checked against [`MAX_FRAME_LEN`] before any
/// payload is buffered. A connection closing mid-payload is reported as
/// `Truncated` with the number of bytes that did arrive.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, FrameError>
where
    R: AsyncRead + Unpin,
{
    let length = reader.read_u32().await? as usize;
    if length == 0 {
        trace!("Received keep-alive");
        return Ok(Message::KeepAlive);
    }
    if length > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            length,
            max: MAX_FRAME_LEN,
        });
    }

    let mut body = BytesMut::zeroed(length);
    let mut received = 0;
    while received < length {
        let n = reader.read(&mut body[received..]).await?;
        if n == 0 {
            return Err(FrameError::Truncated {
                expected: length,
                received,
            });
        }
        received += n;
    }

    let mut body = body.freeze();
    let id = body.get_u8();
    trace!("Received message id {} with {} payload bytes", id, body.len());
    Message::parse(id, body)
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.serialize()).await?;
    writer.flush().await
}
