//! Peer session
//!
//! Drives one TCP connection from connect through handshake and interest
//! to the first UNCHOKE, then hands the open session to the downloader.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use super::bitfield::Bitfield;
use super::handshake::{Handshake, HANDSHAKE_LEN};
use super::message::{read_message, write_message, Message};
use crate::error::{FrameError, HandshakeError};
use crate::tracker::PeerEndpoint;

/// Where a session stands. `Rejected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    HandshakeSent,
    HandshakeVerified,
    InterestedSent,
    Unchoked,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on connecting and on every read or write until unchoked
    pub timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
        }
    }
}

/// An open connection to one peer
pub struct PeerSession {
    addr: SocketAddr,
    stream: TcpStream,
    state: SessionState,
    /// Peer ID from the remote handshake. Recorded, never checked.
    pub remote_peer_id: [u8; 20],
    /// Whether the remote side is currently choking us
    pub choked: bool,
    /// Pieces the remote side has announced via BITFIELD and HAVE
    pub bitfield: Bitfield,
}

impl PeerSession {
    /// Connect, handshake and wait for the first UNCHOKE
    pub async fn connect(
        endpoint: PeerEndpoint,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        config: &SessionConfig,
    ) -> Result<Self, HandshakeError> {
        let addr = endpoint.socket_addr();
        info!("Connecting to peer: {}", addr);

        let stream = timeout(config.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                warn!("Connection timeout to {}", addr);
                HandshakeError::Timeout {
                    addr,
                    stage: "connecting",
                    timeout: config.timeout,
                }
            })?
            .map_err(|source| {
                error!("Failed to connect to {}: {}", addr, source);
                HandshakeError::Connect { addr, source }
            })?;

        let mut session = Self {
            addr,
            stream,
            state: SessionState::Connecting,
            remote_peer_id: [0u8; 20],
            choked: true,
            bitfield: Bitfield::default(),
        };

        match session.establish(info_hash, peer_id, config).await {
            Ok(()) => {
                info!("Peer {} unchoked us", addr);
                Ok(session)
            }
            Err(e) => {
                session.state = SessionState::Rejected;
                warn!("Peer {} rejected: {}", addr, e);
                Err(e)
            }
        }
    }

    async fn establish(
        &mut self,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        config: &SessionConfig,
    ) -> Result<(), HandshakeError> {
        let addr = self.addr;

        let ours = Handshake::new(info_hash, peer_id).serialize();
        timeout(config.timeout, self.stream.write_all(&ours))
            .await
            .map_err(|_| HandshakeError::Timeout {
                addr,
                stage: "sending handshake",
                timeout: config.timeout,
            })?
            .map_err(|source| HandshakeError::Io {
                addr,
                stage: "sending handshake",
                source,
            })?;
        self.state = SessionState::HandshakeSent;
        debug!("Sent handshake to {}", addr);

        let reply = timeout(config.timeout, self.read_handshake())
            .await
            .map_err(|_| HandshakeError::Timeout {
                addr,
                stage: "reading handshake",
                timeout: config.timeout,
            })??;
        let theirs =
            Handshake::deserialize(&reply).ok_or(HandshakeError::InvalidProtocol { addr })?;
        if !theirs.validate(&info_hash) {
            return Err(HandshakeError::InfoHashMismatch {
                addr,
                expected: hex::encode(info_hash),
                actual: hex::encode(theirs.info_hash),
            });
        }
        self.remote_peer_id = theirs.peer_id;
        self.state = SessionState::HandshakeVerified;
        debug!(
            "Handshake verified with {} (peer id {})",
            addr,
            String::from_utf8_lossy(&theirs.peer_id)
        );

        // Interest is declared once the peer has said something real,
        // typically its BITFIELD.
        let first = self.next_real_message(config).await?;
        self.send_setup(&Message::Interested, config).await?;
        self.state = SessionState::InterestedSent;
        debug!("Sent INTERESTED to {}", addr);

        if first == Message::Unchoke {
            self.state = SessionState::Unchoked;
            return Ok(());
        }
        loop {
            if self.next_real_message(config).await? == Message::Unchoke {
                self.state = SessionState::Unchoked;
                return Ok(());
            }
        }
    }

    /// Read exactly one handshake, counting bytes so a short reply can be
    /// reported as such
    async fn read_handshake(&mut self) -> Result<[u8; HANDSHAKE_LEN], HandshakeError> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        let mut received = 0;
        while received < HANDSHAKE_LEN {
            let n = self
                .stream
                .read(&mut buf[received..])
                .await
                .map_err(|source| HandshakeError::Io {
                    addr: self.addr,
                    stage: "reading handshake",
                    source,
                })?;
            if n == 0 {
                return Err(HandshakeError::ShortHandshake {
                    addr: self.addr,
                    received,
                });
            }
            received += n;
        }
        Ok(buf)
    }

    /// Next message that is not a keep-alive, each read bounded by the
    /// setup timeout. A known message with a bad payload length has been
    /// read in full, so it is skipped like any other noise.
    async fn next_real_message(&mut self, config: &SessionConfig) -> Result<Message, HandshakeError> {
        let addr = self.addr;
        loop {
            let result = timeout(config.timeout, self.next_message())
                .await
                .map_err(|_| HandshakeError::Timeout {
                    addr,
                    stage: "waiting for unchoke",
                    timeout: config.timeout,
                })?;
            let message = match result {
                Ok(message) => message,
                Err(FrameError::Malformed { kind, reason }) => {
                    debug!("Skipping malformed {} from {}: {}", kind, addr, reason);
                    continue;
                }
                Err(FrameError::Io(source)) => {
                    return Err(HandshakeError::Io {
                        addr,
                        stage: "waiting for unchoke",
                        source,
                    })
                }
                Err(other) => {
                    return Err(HandshakeError::Protocol {
                        addr,
                        reason: other.to_string(),
                    })
                }
            };
            if message != Message::KeepAlive {
                return Ok(message);
            }
        }
    }

    async fn send_setup(&mut self, message: &Message, config: &SessionConfig) -> Result<(), HandshakeError> {
        let addr = self.addr;
        timeout(config.timeout, write_message(&mut self.stream, message))
            .await
            .map_err(|_| HandshakeError::Timeout {
                addr,
                stage: "sending interested",
                timeout: config.timeout,
            })?
            .map_err(|source| HandshakeError::Io {
                addr,
                stage: "sending interested",
                source,
            })
    }

    /// Read one frame and fold choke and availability updates into the
    /// session before returning it
    pub async fn next_message(&mut self) -> Result<Message, FrameError> {
        let message = read_message(&mut self.stream).await?;
        match &message {
            Message::KeepAlive => trace!("Keep-alive from {}", self.addr),
            Message::Choke => {
                debug!("Peer {} choked us", self.addr);
                self.choked = true;
                if self.state == SessionState::Unchoked {
                    self.state = SessionState::InterestedSent;
                }
            }
            Message::Unchoke => {
                self.choked = false;
                if self.state == SessionState::InterestedSent {
                    self.state = SessionState::Unchoked;
                }
            }
            Message::Bitfield { bitfield } => {
                self.bitfield = Bitfield::from_bytes(bitfield);
                debug!(
                    "Peer {} advertises {} pieces",
                    self.addr,
                    self.bitfield.count()
                );
            }
            Message::Have { piece_index } => {
                if !self.bitfield.set_piece(*piece_index as usize) {
                    debug!(
                        "Dropping HAVE {} from {}: outside its bitfield",
                        piece_index, self.addr
                    );
                }
            }
            other => trace!("Ignoring {:?} from {}", other.id(), self.addr),
        }
        Ok(message)
    }

    pub async fn send_message(&mut self, message: &Message) -> std::io::Result<()> {
        trace!("Sending message id {:?} to {}", message.id(), self.addr);
        write_message(&mut self.stream, message).await
    }

    /// Mark the session dead after a failure the caller cannot recover from
    pub fn reject(&mut self) {
        self.state = SessionState::Rejected;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_unchoked(&self) -> bool {
        self.state == SessionState::Unchoked && !self.choked
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    pub(crate) const INFO_HASH: [u8; 20] = [0x5A; 20];

    /// Accept one connection, answer the handshake with `reply_hash`, then
    /// write `after` and hand the socket to `rest`
    pub(crate) async fn spawn_peer<F, Fut>(reply_hash: [u8; 20], after: Vec<u8>, rest: F) -> PeerEndpoint
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut theirs = [0u8; HANDSHAKE_LEN];
            socket.read_exact(&mut theirs).await.unwrap();
            let reply = Handshake::new(reply_hash, *b"-XX0000-remotepeerid").serialize();
            socket.write_all(&reply).await.unwrap();
            socket.write_all(&after).await.unwrap();
            rest(socket).await;
        });
        PeerEndpoint::new(Ipv4Addr::LOCALHOST, port)
    }

    fn frames(messages: &[Message]) -> Vec<u8> {
        messages.iter().flat_map(|m| m.serialize()).collect()
    }

    async fn expect_interested(mut socket: TcpStream) {
        let mut buf = [0u8; 5];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0, 0, 0, 1, 2]);
        // keep the socket open until the client is done
        let _ = socket.read(&mut [0u8; 1]).await;
    }

    #[tokio::test]
    async fn test_session_reaches_unchoked() {
        let after = frames(&[
            Message::KeepAlive,
            Message::Bitfield {
                bitfield: bytes::Bytes::from_static(&[0b1010_0000]),
            },
        ]);
        let endpoint = spawn_peer(INFO_HASH, after, |mut socket| async move {
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, [0, 0, 0, 1, 2]);
            let rest = frames(&[
                Message::KeepAlive,
                Message::Have { piece_index: 3 },
                Message::Other {
                    id: 20,
                    payload: bytes::Bytes::from_static(b"d1:ai0ee"),
                },
                Message::KeepAlive,
                Message::Unchoke,
            ]);
            socket.write_all(&rest).await.unwrap();
            let _ = socket.read(&mut [0u8; 1]).await;
        })
        .await;

        let session = PeerSession::connect(endpoint, INFO_HASH, [1u8; 20], &SessionConfig::default())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Unchoked);
        assert!(session.is_unchoked());
        assert_eq!(&session.remote_peer_id, b"-XX0000-remotepeerid");
        assert!(session.bitfield.has_piece(0));
        assert!(session.bitfield.has_piece(2));
        assert!(session.bitfield.has_piece(3));
        assert!(!session.bitfield.has_piece(1));
    }

    #[tokio::test]
    async fn test_unchoke_as_first_message() {
        let endpoint = spawn_peer(INFO_HASH, frames(&[Message::Unchoke]), expect_interested).await;
        let session = PeerSession::connect(endpoint, INFO_HASH, [1u8; 20], &SessionConfig::default())
            .await
            .unwrap();
        assert!(session.is_unchoked());
    }

    #[tokio::test]
    async fn test_info_hash_mismatch_rejected() {
        let endpoint = spawn_peer([0xEE; 20], frames(&[Message::Unchoke]), |_| async {}).await;
        let result =
            PeerSession::connect(endpoint, INFO_HASH, [1u8; 20], &SessionConfig::default()).await;
        assert!(matches!(result, Err(HandshakeError::InfoHashMismatch { .. })));
    }

    #[tokio::test]
    async fn test_short_handshake_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut theirs = [0u8; HANDSHAKE_LEN];
            socket.read_exact(&mut theirs).await.unwrap();
            socket.write_all(&theirs[..30]).await.unwrap();
        });

        let endpoint = PeerEndpoint::new(Ipv4Addr::LOCALHOST, port);
        let result =
            PeerSession::connect(endpoint, INFO_HASH, [1u8; 20], &SessionConfig::default()).await;
        assert!(matches!(
            result,
            Err(HandshakeError::ShortHandshake { received: 30, .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_frames_skipped_before_unchoke() {
        let mut after = vec![0, 0, 0, 3, 4, 0, 1];
        after.extend_from_slice(&[0, 0, 0, 2, 7, 0]);
        after.extend_from_slice(&[0, 0, 0, 5, 6, 0, 0, 0, 1]);
        after.extend(frames(&[Message::Unchoke]));
        let endpoint = spawn_peer(INFO_HASH, after, expect_interested).await;

        let session = PeerSession::connect(endpoint, INFO_HASH, [1u8; 20], &SessionConfig::default())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Unchoked);
    }

    #[tokio::test]
    async fn test_out_of_range_have_dropped() {
        let endpoint = spawn_peer(INFO_HASH, frames(&[Message::Unchoke]), |mut socket| async move {
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            let have = frames(&[Message::Have {
                piece_index: u32::MAX,
            }]);
            socket.write_all(&have).await.unwrap();
            let _ = socket.read(&mut [0u8; 1]).await;
        })
        .await;

        let mut session = PeerSession::connect(endpoint, INFO_HASH, [1u8; 20], &SessionConfig::default())
            .await
            .unwrap();
        let message = session.next_message().await.unwrap();
        assert_eq!(
            message,
            Message::Have {
                piece_index: u32::MAX
            }
        );
        assert!(session.bitfield.as_bytes().is_empty());
        assert!(!session.bitfield.has_piece(u32::MAX as usize));
        assert!(session.is_unchoked());
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let endpoint = spawn_peer(INFO_HASH, Vec::new(), |socket| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        })
        .await;
        let config = SessionConfig {
            timeout: Duration::from_millis(200),
        };
        let result = PeerSession::connect(endpoint, INFO_HASH, [1u8; 20], &config).await;
        match result {
            Err(e @ HandshakeError::Timeout { .. }) => assert!(e.to_string().contains("200ms")),
            Err(other) => panic!("expected timeout, got {}", other),
            Ok(_) => panic!("expected timeout"),
        }
    }
}
