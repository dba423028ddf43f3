//! bitfetch - Main entry point
//!
//! Loads a torrent, asks its trackers for peers, and fetches and verifies
//! pieces from the first peer that unchokes us. Nothing is written to disk.

use anyhow::{bail, Context, Result};
use bitfetch::{
    download_piece, fetch_peers, generate_peer_id, verify_piece, AnnounceRequest, CliArgs, Config,
    Metainfo, PeerEndpoint, PeerSession, PieceSelection,
};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        if let Some(location) = panic_info.location() {
            error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            );
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("bitfetch starting");
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args);
    config.validate().context("Invalid configuration")?;

    let metainfo = load_torrent_file(&config.torrent_file).context("Failed to load torrent file")?;
    display_torrent_info(&metainfo);

    let pieces: Vec<u32> = match config.pieces {
        PieceSelection::One(index) => {
            if index as usize >= metainfo.piece_count() {
                bail!(
                    "Piece {} out of range: torrent has {} pieces",
                    index,
                    metainfo.piece_count()
                );
            }
            vec![index]
        }
        PieceSelection::All => (0..metainfo.piece_count() as u32).collect(),
    };

    let peer_id = generate_peer_id();
    let peers = discover_peers(&metainfo, peer_id, &config)
        .await
        .context("Failed to obtain peers from any tracker")?;

    let started = Instant::now();
    let mut session = connect_first_peer(&peers, &metainfo, peer_id, &config)
        .await
        .context("No peer reached the unchoked state")?;

    let mut fetched: u64 = 0;
    for index in &pieces {
        let index = *index;
        let piece_len = metainfo
            .piece_size(index as usize)
            .with_context(|| format!("Piece {} has no size", index))?;
        let expected = metainfo
            .piece_hash(index as usize)
            .with_context(|| format!("Piece {} has no hash", index))?;

        let data = download_piece(&mut session, index, piece_len, &config.download)
            .await
            .with_context(|| format!("Failed to download piece {} from {}", index, session.addr()))?;
        verify_piece(index, &data, &expected)
            .with_context(|| format!("Piece {} is corrupt", index))?;

        fetched += data.len() as u64;
        info!("Piece {} verified ({} bytes)", index, data.len());
    }

    let elapsed = started.elapsed();
    println!();
    println!("Fetched {} piece(s) from {}", pieces.len(), session.addr());
    println!("  Bytes: {}", format_bytes(fetched));
    println!("  Time:  {:.2}s", elapsed.as_secs_f64());

    info!("bitfetch finished");
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized");
}

/// Load and parse the torrent file
fn load_torrent_file(path: &Path) -> Result<Metainfo> {
    info!("Loading torrent file: {}", path.display());

    let torrent_data = std::fs::read(path)
        .with_context(|| format!("Failed to read torrent file '{}'", path.display()))?;
    debug!("Torrent file size: {} bytes", torrent_data.len());

    let metainfo = Metainfo::from_bytes(&torrent_data).map_err(|e| {
        error!("Failed to parse torrent file '{}': {}", path.display(), e);
        e
    })?;
    Ok(metainfo)
}

fn display_torrent_info(metainfo: &Metainfo) {
    println!("Torrent Information:");
    println!("  Name: {}", metainfo.name);
    println!(
        "  Size: {} ({})",
        metainfo.total_size(),
        format_bytes(metainfo.total_size())
    );
    println!("  Pieces: {}", metainfo.piece_count());
    println!("  Piece length: {}", format_bytes(metainfo.piece_length));
    println!("  Info hash: {}", metainfo.info_hash_hex());
    println!("  Trackers: {}", metainfo.announce_list.len());
    println!();
}

/// Ask each announce URL in turn until one hands out peers
async fn discover_peers(
    metainfo: &Metainfo,
    peer_id: [u8; 20],
    config: &Config,
) -> Result<Vec<PeerEndpoint>> {
    let mut last_error = None;
    for url in &metainfo.announce_list {
        let request = AnnounceRequest::new(
            url.as_str(),
            metainfo.info_hash,
            peer_id,
            config.port,
            metainfo.total_size(),
        );
        match fetch_peers(&request, &config.tracker).await {
            Ok(peers) if !peers.is_empty() => return Ok(peers),
            Ok(_) => warn!("Tracker {} returned no peers", url),
            Err(e) => {
                warn!("Tracker {} failed: {}", url, e);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) => Err(e.into()),
        None => bail!("Trackers returned no peers"),
    }
}

/// Try peers in tracker order; the first to unchoke us wins
async fn connect_first_peer(
    peers: &[PeerEndpoint],
    metainfo: &Metainfo,
    peer_id: [u8; 20],
    config: &Config,
) -> Result<PeerSession> {
    for (attempt, peer) in peers.iter().take(config.max_peers).enumerate() {
        debug!("Peer attempt {} of {}: {}", attempt + 1, peers.len().min(config.max_peers), peer);
        match PeerSession::connect(*peer, metainfo.info_hash, peer_id, &config.session).await {
            Ok(session) => return Ok(session),
            Err(e) => warn!("Peer {} failed: {}", peer, e),
        }
    }
    bail!("Tried {} peers without success", peers.len().min(config.max_peers))
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
