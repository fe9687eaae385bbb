//! Command line interface definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Tidelog: a partitioned, generation-aware transaction log server.
#[derive(Parser)]
#[command(name = "tidelog")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the log server.
    Serve(ServeArgs),
    /// Decode a backup mutation-log file to stdout.
    Decode(DecodeArgs),
    /// Print version information.
    Version,
}

/// Arguments for the serve command.
#[derive(Args)]
pub struct ServeArgs {
    /// Path to configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Data directory (overrides config).
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,
}

/// Arguments for the decode command.
#[derive(Args)]
pub struct DecodeArgs {
    /// Log file to decode.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Block size the file was written with.
    #[arg(long, default_value = "1048576")]
    pub block_size: usize,
}
