//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for the piece fetcher
#[derive(Debug, Parser)]
#[command(name = "bitfetch")]
#[command(about = "Fetch and verify torrent pieces from a single peer", long_about = None)]
pub struct CliArgs {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Port reported to the tracker
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Index of the piece to fetch
    #[arg(long, default_value_t = 0)]
    pub piece: u32,

    /// Fetch every piece in order from the first unchoking peer
    #[arg(long, conflicts_with = "piece")]
    pub all_pieces: bool,

    /// Bytes per block request
    #[arg(long, default_value_t = 16384)]
    pub block_size: u32,

    /// UDP tracker receive timeout, and HTTP tracker I/O timeout
    #[arg(long, default_value_t = 5)]
    pub tracker_timeout_secs: u64,

    /// Extra UDP tracker attempts after a timeout, with doubling waits
    #[arg(long, default_value_t = 0)]
    pub udp_retries: u32,

    /// Accept UDP announce replies carrying fewer peers than declared
    #[arg(long)]
    pub lenient_peer_count: bool,

    /// Connect and handshake timeout per peer
    #[arg(long, default_value_t = 3)]
    pub peer_timeout_secs: u64,

    /// Timeout on each read while waiting for block data
    #[arg(long, default_value_t = 30)]
    pub block_timeout_secs: u64,

    /// Maximum number of peers to try
    #[arg(short, long, default_value_t = 50)]
    pub max_peers: usize,

    /// HTTP tracker replies above this size are rejected
    #[arg(long, default_value_t = 1024 * 1024)]
    pub max_response_bytes: usize,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
