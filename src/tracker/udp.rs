//! UDP tracker protocol (BEP 15)
//!
//! A connect exchange yields a connection ID, which the announce exchange
//! then carries. Every reply is correlated with its request by transaction
//! ID; a mismatch ends the exchange.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::{parse_compact_peers, AnnounceRequest, PeerEndpoint, Tracker};
use crate::error::TrackerError;

/// Magic constant opening every connect request
pub const PROTOCOL_ID: u64 = 0x41727101980;

pub const ACTION_CONNECT: u32 = 0;
pub const ACTION_ANNOUNCE: u32 = 1;
pub const ACTION_ERROR: u32 = 3;

/// A connection ID may be reused for this long after it was issued
pub const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

const CONNECT_REQUEST_LEN: usize = 16;
const CONNECT_RESPONSE_LEN: usize = 16;
const ANNOUNCE_REQUEST_LEN: usize = 98;
const ANNOUNCE_RESPONSE_HEADER_LEN: usize = 20;
const MAX_DATAGRAM: usize = 65_536;

/// Timeout and retry policy for one UDP tracker
#[derive(Debug, Clone)]
pub struct UdpTrackerConfig {
    /// Receive timeout of the first attempt
    pub timeout: Duration,
    /// Extra attempts after a timeout. Attempt `n` waits `timeout * 2^n`.
    /// Zero means a single attempt.
    pub retries: u32,
    /// Require the compact peer data to hold exactly `leechers + seeders`
    /// entries. When off, fewer peers than declared are accepted.
    pub strict_peer_count: bool,
}

impl Default for UdpTrackerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 0,
            strict_peer_count: true,
        }
    }
}

impl UdpTrackerConfig {
    pub fn timeout_for_attempt(&self, attempt: u32) -> Duration {
        self.timeout.saturating_mul(1u32 << attempt.min(8))
    }
}

/// Build a 16-byte connect request
pub fn encode_connect_request(transaction_id: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(CONNECT_REQUEST_LEN);
    buf.put_u64(PROTOCOL_ID);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);
    buf.to_vec()
}

/// Validate a connect response and extract the connection ID
pub fn parse_connect_response(data: &[u8], transaction_id: u32) -> Result<u64, TrackerError> {
    let mut buf = check_header(data, transaction_id, ACTION_CONNECT, CONNECT_RESPONSE_LEN)?;
    Ok(buf.get_u64())
}

/// Build a 98-byte announce request
pub fn encode_announce_request(
    connection_id: u64,
    transaction_id: u32,
    key: u32,
    request: &AnnounceRequest,
) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(ANNOUNCE_REQUEST_LEN);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(transaction_id);
    buf.put_slice(&request.info_hash);
    buf.put_slice(&request.peer_id);
    buf.put_u64(request.downloaded);
    buf.put_u64(request.left);
    buf.put_u64(request.uploaded);
    buf.put_u32(0); // event: none
    buf.put_u32(0); // ip: let the tracker use the source address
    buf.put_u32(key);
    buf.put_i32(-1); // num_want: tracker default
    buf.put_u16(request.port);
    buf.to_vec()
}

/// Decoded announce reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpAnnounceResponse {
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<PeerEndpoint>,
}

/// Validate an announce response and decode its compact peer list
pub fn parse_announce_response(
    data: &[u8],
    transaction_id: u32,
    strict_peer_count: bool,
) -> Result<UdpAnnounceResponse, TrackerError> {
    let mut buf = check_header(
        data,
        transaction_id,
        ACTION_ANNOUNCE,
        ANNOUNCE_RESPONSE_HEADER_LEN,
    )?;
    let interval = buf.get_u32();
    let leechers = buf.get_u32();
    let seeders = buf.get_u32();

    let declared = (leechers as usize + seeders as usize).saturating_mul(6);
    let actual = buf.remaining();
    let count_ok = if strict_peer_count {
        actual == declared
    } else {
        actual <= declared
    };
    if !count_ok {
        return Err(TrackerError::PeerCountMismatch {
            expected: declared,
            actual,
        });
    }

    Ok(UdpAnnounceResponse {
        interval,
        leechers,
        seeders,
        peers: parse_compact_peers(buf)?,
    })
}

/// Check transaction ID then action, and the minimum length for that
/// action. Returns the bytes after the 8-byte header.
fn check_header(
    data: &[u8],
    transaction_id: u32,
    expected_action: u32,
    min_len: usize,
) -> Result<&[u8], TrackerError> {
    if data.len() < 8 {
        return Err(TrackerError::ShortResponse {
            expected: min_len,
            actual: data.len(),
        });
    }
    let mut buf = data;
    let action = buf.get_u32();
    let received_tid = buf.get_u32();

    if received_tid != transaction_id {
        return Err(TrackerError::TransactionMismatch {
            expected: transaction_id,
            actual: received_tid,
        });
    }
    if action == ACTION_ERROR {
        return Err(TrackerError::TrackerFailure(
            String::from_utf8_lossy(buf).into_owned(),
        ));
    }
    if action != expected_action {
        return Err(TrackerError::ActionMismatch {
            expected: expected_action,
            actual: action,
        });
    }
    if data.len() < min_len {
        return Err(TrackerError::ShortResponse {
            expected: min_len,
            actual: data.len(),
        });
    }
    Ok(buf)
}

/// A UDP tracker bound to one resolved address
pub struct UdpTracker {
    socket: UdpSocket,
    addr: SocketAddr,
    config: UdpTrackerConfig,
    connection: Option<(u64, Instant)>,
}

impl UdpTracker {
    /// Resolve `host:port` to an IPv4 address and open a socket to it
    pub async fn connect(
        host: &str,
        port: u16,
        config: UdpTrackerConfig,
    ) -> Result<Self, TrackerError> {
        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| TrackerError::Resolve {
                host: host.to_string(),
                source,
            })?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| TrackerError::NoAddress(host.to_string()))?;
        debug!("Resolved UDP tracker {}:{} to {}", host, port, addr);
        Self::with_addr(addr, config).await
    }

    pub async fn with_addr(addr: SocketAddr, config: UdpTrackerConfig) -> Result<Self, TrackerError> {
        let io_err = |source: std::io::Error| TrackerError::Io {
            addr: addr.to_string(),
            source,
        };
        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(io_err)?;
        socket.connect(addr).await.map_err(io_err)?;

        Ok(Self {
            socket,
            addr,
            config,
            connection: None,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Reuse the cached connection ID while it is fresh, otherwise run the
    /// connect exchange again
    async fn connection_id(&mut self) -> Result<u64, TrackerError> {
        if let Some((id, issued)) = self.connection {
            if issued.elapsed() < CONNECTION_ID_TTL {
                trace!("Reusing connection id {:#018x}", id);
                return Ok(id);
            }
            debug!("Connection id for {} expired", self.addr);
        }

        let transaction_id: u32 = rand::random();
        debug!(
            "Sending connect request to {} (transaction {:#010x})",
            self.addr, transaction_id
        );
        let reply = self
            .exchange(&encode_connect_request(transaction_id))
            .await?;
        let id = parse_connect_response(&reply, transaction_id)?;
        debug!("Obtained connection id {:#018x} from {}", id, self.addr);
        self.connection = Some((id, Instant::now()));
        Ok(id)
    }

    /// Full connect + announce exchange
    pub async fn announce_full(
        &mut self,
        request: &AnnounceRequest,
    ) -> Result<UdpAnnounceResponse, TrackerError> {
        let connection_id = self.connection_id().await?;
        let transaction_id: u32 = rand::random();
        let key: u32 = rand::random();

        debug!(
            "Sending announce to {} (transaction {:#010x})",
            self.addr, transaction_id
        );
        let packet = encode_announce_request(connection_id, transaction_id, key, request);
        let reply = self.exchange(&packet).await?;
        let response =
            parse_announce_response(&reply, transaction_id, self.config.strict_peer_count)?;

        info!(
            "UDP tracker {}: interval {}s, {} seeders, {} leechers, {} peers",
            self.addr,
            response.interval,
            response.seeders,
            response.leechers,
            response.peers.len()
        );
        Ok(response)
    }

    /// Send one datagram and wait for one reply, retrying on timeout per
    /// the configured policy
    async fn exchange(&self, packet: &[u8]) -> Result<Vec<u8>, TrackerError> {
        let io_err = |source: std::io::Error| TrackerError::Io {
            addr: self.addr.to_string(),
            source,
        };
        let mut buf = vec![0u8; MAX_DATAGRAM];

        for attempt in 0..=self.config.retries {
            self.socket.send(packet).await.map_err(io_err)?;
            let wait = self.config.timeout_for_attempt(attempt);
            trace!(
                "Sent {} bytes to {}, waiting {:?} (attempt {})",
                packet.len(),
                self.addr,
                wait,
                attempt + 1
            );

            match timeout(wait, self.socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    trace!("Received {} bytes from {}", n, self.addr);
                    buf.truncate(n);
                    return Ok(buf);
                }
                Ok(Err(e)) => return Err(io_err(e)),
                Err(_) => warn!(
                    "UDP tracker {} timed out after {:?} (attempt {})",
                    self.addr,
                    wait,
                    attempt + 1
                ),
            }
        }

        Err(TrackerError::Timeout {
            addr: self.addr.to_string(),
            timeout: self.config.timeout_for_attempt(self.config.retries),
        })
    }
}

#[async_trait]
impl Tracker for UdpTracker {
    async fn announce(
        &mut self,
        request: &AnnounceRequest,
    ) -> Result<Vec<PeerEndpoint>, TrackerError> {
        Ok(self.announce_full(request).await?.peers)
    }

    fn describe(&self) -> String {
        format!("udp://{}", self.addr)
    }
}
