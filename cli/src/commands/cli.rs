use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "harvest", version, about = "Harvest social posts into derived events")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file to load instead of ~/.harvest/config.toml or ./config.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "harvest.engine=debug". RUST_LOG still wins.
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Poll the feed and harvest new posts until interrupted.
    Run,
    /// Run one detection cycle, harvest what it found and print a summary.
    Once,
    /// Validate config and handlers, then print the effective config.
    Check,
}
