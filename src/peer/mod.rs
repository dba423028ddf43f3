//! Peer wire protocol
//!
//! Handshake, message framing and the session state machine that gets a
//! connection from TCP connect to unchoked.

pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod session;

pub use bitfield::Bitfield;
pub use handshake::{generate_peer_id, Handshake, HANDSHAKE_LEN};
pub use message::{read_message, write_message, Message, MessageId, MAX_BLOCK_LEN, MAX_FRAME_LEN};
pub use session::{PeerSession, SessionConfig, SessionState};
