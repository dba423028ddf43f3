//! HTTP tracker announce
//!
//! Plain `http` trackers are spoken to over a raw TCP stream: one GET,
//! `Connection: close`, then read until the tracker hangs up. `https`
//! trackers go through reqwest when the `https` feature is enabled.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use super::{parse_compact_peers, AnnounceRequest, PeerEndpoint, Tracker};
use crate::bencode::{self, BencodeNode};
use crate::error::TrackerError;

const READ_CHUNK: usize = 4096;

/// Limits applied to one HTTP announce
#[derive(Debug, Clone)]
pub struct HttpTrackerConfig {
    /// Bound on connecting, and separately on each read or write
    pub timeout: Duration,
    /// Replies larger than this fail instead of being truncated
    pub max_response_bytes: usize,
}

impl Default for HttpTrackerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_response_bytes: 1024 * 1024,
        }
    }
}

/// Query string shared by the plain and TLS clients. The two binary
/// fields are percent-encoded byte by byte.
pub fn announce_query(request: &AnnounceRequest) -> String {
    format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&event=started",
        urlencoding::encode_binary(&request.info_hash),
        urlencoding::encode_binary(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
    )
}

fn join_query(path: &str, query: &str) -> String {
    let separator = if path.contains('?') { '&' } else { '?' };
    format!("{}{}{}", path, separator, query)
}

/// Full request text for a raw-socket announce. The Host header names the
/// port unless it is the HTTP default.
pub fn build_request(host: &str, port: u16, path: &str, request: &AnnounceRequest) -> String {
    let target = join_query(if path.is_empty() { "/" } else { path }, &announce_query(request));
    let authority = if port == 80 {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    };
    format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: bitfetch/{}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
        target,
        authority,
        env!("CARGO_PKG_VERSION")
    )
}

/// Split a raw response into status code, header block and body.
///
/// The head ends at the first `\r\n\r\n`, or at `\n\n` for trackers that
/// skip the carriage returns. A chunked body is reassembled.
pub fn split_http_response(raw: &[u8]) -> Result<(u16, String, Vec<u8>), TrackerError> {
    let (head_end, body_start) = find_subslice(raw, b"\r\n\r\n")
        .map(|i| (i, i + 4))
        .or_else(|| find_subslice(raw, b"\n\n").map(|i| (i, i + 2)))
        .ok_or_else(|| TrackerError::MalformedHttp("no header/body separator".into()))?;

    let head = String::from_utf8_lossy(&raw[..head_end]).into_owned();
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let status = match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse::<u16>()
            .map_err(|_| TrackerError::MalformedHttp(format!("bad status line `{}`", status_line)))?,
        _ => {
            return Err(TrackerError::MalformedHttp(format!(
                "bad status line `{}`",
                status_line
            )))
        }
    };

    let body = &raw[body_start..];
    let chunked = head.lines().skip(1).any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
        })
    });
    let body = if chunked {
        decode_chunked(body)?
    } else {
        body.to_vec()
    };

    Ok((status, head, body))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reassemble a `Transfer-Encoding: chunked` body
pub fn decode_chunked(mut data: &[u8]) -> Result<Vec<u8>, TrackerError> {
    let mut out = Vec::new();
    loop {
        let line_end = find_subslice(data, b"\r\n")
            .ok_or_else(|| TrackerError::MalformedHttp("unterminated chunk size".into()))?;
        let size_text = String::from_utf8_lossy(&data[..line_end]);
        let size_text = size_text.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| TrackerError::MalformedHttp(format!("bad chunk size `{}`", size_text)))?;
        data = &data[line_end + 2..];

        if size == 0 {
            return Ok(out);
        }
        if data.len() < size {
            return Err(TrackerError::MalformedHttp(format!(
                "chunk declares {} bytes but only {} remain",
                size,
                data.len()
            )));
        }
        out.extend_from_slice(&data[..size]);
        data = &data[size..];
        data = data.strip_prefix(b"\r\n").unwrap_or(data);
    }
}

/// Decode a tracker body and pull out its compact peer list
pub fn parse_announce_body(body: &[u8]) -> Result<Vec<PeerEndpoint>, TrackerError> {
    let root: BencodeNode = bencode::decode(body)?;
    if root.as_dict().is_none() {
        return Err(TrackerError::MalformedHttp(format!(
            "tracker body is a {}, not a dictionary",
            root.value.kind()
        )));
    }

    if let Some(reason) = root.lookup(b"failure reason") {
        let reason = reason
            .as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_else(|| "unspecified".to_string());
        return Err(TrackerError::TrackerFailure(reason));
    }
    if let Some(warning) = root.lookup(b"warning message").and_then(|n| n.as_str()) {
        warn!("Tracker warning: {}", warning);
    }
    if let Some(interval) = root.lookup(b"interval").and_then(|n| n.as_int()) {
        debug!("Tracker interval: {}s", interval);
    }

    let peers = root
        .lookup(b"peers")
        .and_then(|n| n.as_bytes())
        .ok_or(TrackerError::MissingPeers)?;
    parse_compact_peers(peers)
}

fn check_status(status: u16) -> Result<(), TrackerError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(TrackerError::MalformedHttp(format!("tracker answered HTTP {}", status)))
    }
}

/// Announce over a plain TCP connection
#[derive(Debug, Clone)]
pub struct HttpTracker {
    host: String,
    port: u16,
    path: String,
    config: HttpTrackerConfig,
}

impl HttpTracker {
    pub fn new(host: String, port: u16, path: String, config: HttpTrackerConfig) -> Self {
        Self {
            host,
            port,
            path,
            config,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn timeout_err(&self) -> TrackerError {
        TrackerError::Timeout {
            addr: self.addr(),
            timeout: self.config.timeout,
        }
    }

    /// Read until EOF, failing once the reply outgrows the configured cap
    async fn read_response(&self, stream: &mut TcpStream) -> Result<Vec<u8>, TrackerError> {
        let limit = self.config.max_response_bytes;
        let mut response = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = timeout(self.config.timeout, stream.read(&mut chunk))
                .await
                .map_err(|_| self.timeout_err())?
                .map_err(|source| TrackerError::Io {
                    addr: self.addr(),
                    source,
                })?;
            if n == 0 {
                break;
            }
            if response.len() + n > limit {
                error!("Tracker {} response exceeds {} bytes", self.addr(), limit);
                return Err(TrackerError::ResponseTooLarge { limit });
            }
            response.extend_from_slice(&chunk[..n]);
        }

        trace!("Read {} bytes from tracker {}", response.len(), self.addr());
        Ok(response)
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn announce(
        &mut self,
        request: &AnnounceRequest,
    ) -> Result<Vec<PeerEndpoint>, TrackerError> {
        let addr = self.addr();
        let io_err = |source: std::io::Error| TrackerError::Io {
            addr: addr.clone(),
            source,
        };

        debug!("Connecting to HTTP tracker {}", addr);
        let mut stream = timeout(self.config.timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| self.timeout_err())?
            .map_err(io_err)?;

        let text = build_request(&self.host, self.port, &self.path, request);
        trace!("HTTP announce request:\n{}", text);
        timeout(self.config.timeout, stream.write_all(text.as_bytes()))
            .await
            .map_err(|_| self.timeout_err())?
            .map_err(io_err)?;

        let raw = self.read_response(&mut stream).await?;
        let (status, _head, body) = split_http_response(&raw)?;
        debug!("HTTP tracker {} answered {} with {} body bytes", addr, status, body.len());
        check_status(status)?;

        let peers = parse_announce_body(&body)?;
        info!("HTTP tracker {} returned {} peers", addr, peers.len());
        Ok(peers)
    }

    fn describe(&self) -> String {
        format!("http://{}{}", self.addr(), self.path)
    }
}

/// Announce to an `https` tracker through reqwest
#[cfg(feature = "https")]
pub struct HttpsTracker {
    url: String,
    client: reqwest::Client,
    config: HttpTrackerConfig,
}

#[cfg(feature = "https")]
impl HttpsTracker {
    pub fn new(url: String, config: HttpTrackerConfig) -> Result<Self, TrackerError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("bitfetch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            url,
            client,
            config,
        })
    }
}

#[cfg(feature = "https")]
#[async_trait]
impl Tracker for HttpsTracker {
    async fn announce(
        &mut self,
        request: &AnnounceRequest,
    ) -> Result<Vec<PeerEndpoint>, TrackerError> {
        let target = join_query(&self.url, &announce_query(request));
        debug!("Sending HTTPS announce to {}", self.url);

        let response = self
            .client
            .get(target)
            .header(reqwest::header::CONNECTION, "close")
            .send()
            .await?;
        check_status(response.status().as_u16())?;

        let limit = self.config.max_response_bytes;
        if response.content_length().is_some_and(|len| len as usize > limit) {
            return Err(TrackerError::ResponseTooLarge { limit });
        }
        let body = response.bytes().await?;
        if body.len() > limit {
            return Err(TrackerError::ResponseTooLarge { limit });
        }

        let peers = parse_announce_body(&body)?;
        info!("HTTPS tracker {} returned {} peers", self.url, peers.len());
        Ok(peers)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    fn request() -> AnnounceRequest {
        let mut info_hash = [0u8; 20];
        info_hash[0] = b'a';
        info_hash[1] = b' ';
        info_hash[2] = 0xFF;
        AnnounceRequest::new("http://t/announce", info_hash, *b"-BF0001-abcdefghijkl", 6881, 42)
    }

    fn body_with_peers(peers: &[u8]) -> Vec<u8> {
        let mut body = format!("d8:intervali900e5:peers{}:", peers.len()).into_bytes();
        body.extend_from_slice(peers);
        body.push(b'e');
        body
    }

    #[test]
    fn test_request_encoding() {
        let text = build_request("t.example", 80, "/announce", &request());
        assert!(text.starts_with("GET /announce?info_hash=a%20%FF%00%00"));
        assert!(text.contains("&peer_id=-BF0001-abcdefghijkl&port=6881"));
        assert!(text.contains("&uploaded=0&downloaded=0&left=42&compact=1&event=started HTTP/1.1\r\n"));
        assert!(text.contains("Host: t.example\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_request_keeps_existing_query() {
        let text = build_request("t", 80, "/announce?passkey=x", &request());
        assert!(text.starts_with("GET /announce?passkey=x&info_hash="));
    }

    #[test]
    fn test_host_header_carries_non_default_port() {
        let text = build_request("t.example", 6969, "/announce", &request());
        assert!(text.contains("\r\nHost: t.example:6969\r\n"));

        let text = build_request("[::1]", 8080, "/announce", &request());
        assert!(text.contains("\r\nHost: [::1]:8080\r\n"));
    }

    #[test]
    fn test_split_crlf_and_lf() {
        let (status, _, body) = split_http_response(b"HTTP/1.1 200 OK\r\nA: b\r\n\r\nd1:xi1ee").unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"d1:xi1ee");

        let (status, _, body) = split_http_response(b"HTTP/1.0 200 OK\nA: b\n\nbody").unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"body");

        assert!(matches!(
            split_http_response(b"HTTP/1.1 200 OK\r\nA: b\r\n"),
            Err(TrackerError::MalformedHttp(_))
        ));
    }

    #[test]
    fn test_split_chunked() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nd1:x\r\n4\r\ni1ee\r\n0\r\n\r\n";
        let (_, _, body) = split_http_response(raw).unwrap();
        assert_eq!(body, b"d1:xi1ee");
    }

    #[test]
    fn test_announce_body() {
        let peers = parse_announce_body(&body_with_peers(&[1, 2, 3, 4, 0x1A, 0xE1])).unwrap();
        assert_eq!(peers, vec![PeerEndpoint::new(Ipv4Addr::new(1, 2, 3, 4), 6881)]);
    }

    #[test]
    fn test_announce_body_errors() {
        assert!(matches!(
            parse_announce_body(b"d14:failure reason6:bannede"),
            Err(TrackerError::TrackerFailure(r)) if r == "banned"
        ));
        assert!(matches!(
            parse_announce_body(b"d8:intervali900ee"),
            Err(TrackerError::MissingPeers)
        ));
        assert!(matches!(
            parse_announce_body(b"d5:peerslee"),
            Err(TrackerError::MissingPeers)
        ));
        assert!(matches!(
            parse_announce_body(b"i1e"),
            Err(TrackerError::MalformedHttp(_))
        ));
        assert!(matches!(
            parse_announce_body(b"d5:peers"),
            Err(TrackerError::Decode(_))
        ));
    }

    async fn serve_once(reply: Vec<u8>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"GET /announce?info_hash="));
            let host = format!("\r\nHost: 127.0.0.1:{}\r\n", port);
            assert!(String::from_utf8_lossy(&buf[..n]).contains(&host));
            socket.write_all(&reply).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_announce_against_mock_tracker() {
        let mut reply = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n".to_vec();
        reply.extend_from_slice(&body_with_peers(&[127, 0, 0, 1, 0x1A, 0xE1, 127, 0, 0, 2, 0, 80]));
        let port = serve_once(reply).await;

        let mut tracker = HttpTracker::new(
            "127.0.0.1".into(),
            port,
            "/announce".into(),
            HttpTrackerConfig::default(),
        );
        let peers = tracker.announce(&request()).await.unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1], PeerEndpoint::new(Ipv4Addr::new(127, 0, 0, 2), 80));
    }

    #[tokio::test]
    async fn test_non_success_status() {
        let port = serve_once(b"HTTP/1.1 404 Not Found\r\n\r\n".to_vec()).await;
        let mut tracker = HttpTracker::new(
            "127.0.0.1".into(),
            port,
            "/announce".into(),
            HttpTrackerConfig::default(),
        );
        assert!(matches!(
            tracker.announce(&request()).await,
            Err(TrackerError::MalformedHttp(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_response() {
        let mut reply = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        reply.extend_from_slice(&[b'x'; 600]);
        let port = serve_once(reply).await;
        let config = HttpTrackerConfig {
            max_response_bytes: 256,
            ..HttpTrackerConfig::default()
        };
        let mut tracker = HttpTracker::new("127.0.0.1".into(), port, "/announce".into(), config);
        assert!(matches!(
            tracker.announce(&request()).await,
            Err(TrackerError::ResponseTooLarge { limit: 256 })
        ));
    }
}
