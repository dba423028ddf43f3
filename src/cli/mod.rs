//! CLI module
//!
//! Command-line interface for the piece fetcher.

pub mod args;
pub mod config;

pub use args::CliArgs;
pub use config::{Config, PieceSelection};
