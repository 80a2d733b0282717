//! CLI definition using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Sideload - load module archives into a running host and keep them fresh
#[derive(Parser)]
#[command(name = "sideload")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (toml, yaml or json)
    #[arg(short, long, global = true, env = "SIDELOAD_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load every archive in the sideload directory and watch it for changes
    Run {
        /// Sideload directory, overrides the configuration file
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Poll interval of the watcher in milliseconds
        #[arg(long)]
        poll_ms: Option<u64>,

        /// Load once and exit without watching
        #[arg(long)]
        no_watch: bool,
    },

    /// List the modules an archive declares, in load order
    Inspect {
        /// Archive to inspect
        archive: PathBuf,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Write a default configuration file
    InitConfig {
        /// Output file
        #[arg(short, long, default_value = "sideload.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
