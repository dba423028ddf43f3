//! Tracker client
//!
//! Turns an announce URL, info-hash and peer-id into a list of peer
//! endpoints, speaking either the UDP tracker protocol (BEP 15) or HTTP.

pub mod http;
pub mod udp;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

use crate::error::TrackerError;

pub use http::{HttpTracker, HttpTrackerConfig};
#[cfg(feature = "https")]
pub use http::HttpsTracker;
pub use udp::{UdpTracker, UdpTrackerConfig};

/// Parameters of one announce exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub announce_url: String,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    /// Port we claim to listen on
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

impl AnnounceRequest {
    /// A fresh-start announce: nothing uploaded or downloaded yet
    pub fn new(
        announce_url: impl Into<String>,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        port: u16,
        left: u64,
    ) -> Self {
        Self {
            announce_url: announce_url.into(),
            info_hash,
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left,
        }
    }
}

/// An IPv4 peer from a compact peer list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerEndpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerEndpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Decode one 6-byte compact record: 4-byte IPv4 then big-endian port
    pub fn from_compact(bytes: [u8; 6]) -> Self {
        Self {
            ip: Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]),
            port: u16::from_be_bytes([bytes[4], bytes[5]]),
        }
    }

    pub fn to_compact(&self) -> [u8; 6] {
        let mut out = [0u8; 6];
        out[..4].copy_from_slice(&self.ip.octets());
        out[4..].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Decode a compact peer list, preserving order
pub fn parse_compact_peers(data: &[u8]) -> Result<Vec<PeerEndpoint>, TrackerError> {
    if data.len() % 6 != 0 {
        return Err(TrackerError::InvalidCompactPeers(data.len()));
    }

    Ok(data
        .chunks_exact(6)
        .map(|chunk| {
            let mut record = [0u8; 6];
            record.copy_from_slice(chunk);
            PeerEndpoint::from_compact(record)
        })
        .collect())
}

/// Where an announce URL points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerTarget {
    Udp { host: String, port: u16 },
    Http { host: String, port: u16, path: String },
    Https { url: String },
}

/// Split an announce URL into scheme, host and port
pub fn parse_announce_url(announce: &str) -> Result<TrackerTarget, TrackerError> {
    let invalid = |reason: &str| TrackerError::InvalidUrl {
        url: announce.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(announce).map_err(|e| invalid(&e.to_string()))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| invalid("missing host"))?
        .to_string();

    match url.scheme() {
        "udp" => {
            let port = url.port().ok_or_else(|| invalid("udp tracker needs a port"))?;
            Ok(TrackerTarget::Udp { host, port })
        }
        "http" => {
            let port = url.port_or_known_default().unwrap_or(80);
            let path = match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            };
            Ok(TrackerTarget::Http { host, port, path })
        }
        "https" => Ok(TrackerTarget::Https {
            url: announce.to_string(),
        }),
        other => Err(TrackerError::UnsupportedScheme(other.to_string())),
    }
}

/// Settings for both tracker protocols
#[derive(Debug, Clone, Default)]
pub struct TrackerConfig {
    pub udp: UdpTrackerConfig,
    pub http: HttpTrackerConfig,
}

/// One announce round trip, whatever the transport
#[async_trait]
pub trait Tracker: Send {
    async fn announce(
        &mut self,
        request: &AnnounceRequest,
    ) -> Result<Vec<PeerEndpoint>, TrackerError>;

    /// Human-readable tracker address for logs
    fn describe(&self) -> String;
}

/// Build the tracker client matching the announce URL's scheme
pub async fn connect_tracker(
    announce: &str,
    config: &TrackerConfig,
) -> Result<Box<dyn Tracker>, TrackerError> {
    match parse_announce_url(announce)? {
        TrackerTarget::Udp { host, port } => Ok(Box::new(
            UdpTracker::connect(&host, port, config.udp.clone()).await?,
        )),
        TrackerTarget::Http { host, port, path } => Ok(Box::new(HttpTracker::new(
            host,
            port,
            path,
            config.http.clone(),
        ))),
        #[cfg(feature = "https")]
        TrackerTarget::Https { url } => Ok(Box::new(HttpsTracker::new(url, config.http.clone())?)),
        #[cfg(not(feature = "https"))]
        TrackerTarget::Https { .. } => Err(TrackerError::UnsupportedScheme("https".to_string())),
    }
}

/// Announce once and return the peers the tracker handed out.
///
/// Nothing is retried here beyond the UDP retry policy in `config`; the
/// caller decides whether to try another announce URL.
pub async fn fetch_peers(
    request: &AnnounceRequest,
    config: &TrackerConfig,
) -> Result<Vec<PeerEndpoint>, TrackerError> {
    info!("Announcing to tracker: {}", request.announce_url);
    let mut tracker = connect_tracker(&request.announce_url, config).await?;
    let peers = tracker.announce(request).await?;
    info!("Tracker {} returned {} peers", tracker.describe(), peers.len());
    debug!(
        "Peers: {}",
        peers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(peers)
}
