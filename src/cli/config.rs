//! CLI configuration module
//!
//! Turns parsed arguments into the typed settings each component takes.

use crate::cli::args::CliArgs;
use crate::download::DownloadConfig;
use crate::peer::SessionConfig;
use crate::tracker::{HttpTrackerConfig, TrackerConfig, UdpTrackerConfig};
use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Largest block size we will ask a peer for
pub const MAX_BLOCK_SIZE: u32 = 128 * 1024;

/// Which pieces to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceSelection {
    One(u32),
    All,
}

/// Runtime configuration for one fetch
#[derive(Debug, Clone)]
pub struct Config {
    pub torrent_file: PathBuf,
    /// Port reported to the tracker
    pub port: u16,
    pub pieces: PieceSelection,
    pub max_peers: usize,
    pub tracker: TrackerConfig,
    pub session: SessionConfig,
    pub download: DownloadConfig,
    pub verbose: bool,
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Self {
        let tracker_timeout = Duration::from_secs(args.tracker_timeout_secs);

        Self {
            torrent_file: args.torrent_file.clone(),
            port: args.port,
            pieces: if args.all_pieces {
                PieceSelection::All
            } else {
                PieceSelection::One(args.piece)
            },
            max_peers: args.max_peers,
            tracker: TrackerConfig {
                udp: UdpTrackerConfig {
                    timeout: tracker_timeout,
                    retries: args.udp_retries,
                    strict_peer_count: !args.lenient_peer_count,
                },
                http: HttpTrackerConfig {
                    timeout: tracker_timeout,
                    max_response_bytes: args.max_response_bytes,
                },
            },
            session: SessionConfig {
                timeout: Duration::from_secs(args.peer_timeout_secs),
            },
            download: DownloadConfig {
                block_size: args.block_size,
                block_timeout: Duration::from_secs(args.block_timeout_secs),
            },
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow::anyhow!("Port cannot be 0"));
        }

        if self.max_peers == 0 {
            return Err(anyhow::anyhow!("max_peers must be at least 1"));
        }

        if self.download.block_size == 0 || self.download.block_size > MAX_BLOCK_SIZE {
            return Err(anyhow::anyhow!(
                "block_size must be between 1 and {}",
                MAX_BLOCK_SIZE
            ));
        }

        let timeouts = [
            ("tracker timeout", self.tracker.udp.timeout),
            ("peer timeout", self.session.timeout),
            ("block timeout", self.download.block_timeout),
        ];
        for (name, value) in timeouts {
            if value == Duration::ZERO {
                return Err(anyhow::anyhow!("{} must be positive", name));
            }
        }

        if self.tracker.http.max_response_bytes == 0 {
            return Err(anyhow::anyhow!("max_response_bytes must be positive"));
        }

        if self.verbose && self.quiet {
            return Err(anyhow::anyhow!("--verbose and --quiet are mutually exclusive"));
        }

        Ok(())
    }
}
