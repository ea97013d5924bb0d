/// CLI argument parsing

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser, Debug)]
#[command(name = "dvs")]
#[command(author, version = VERSION_WITH_BUILD, about = "Docker Volume Snapshot (dvs)")]
#[command(long_about = "A tool to create and restore snapshots of Docker volumes.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Never pull the helper image from a registry
    #[arg(long, global = true)]
    pub offline: bool,

    /// Give up waiting on the helper container after this long (e.g. 30m, 2h)
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create snapshot file from docker volume
    #[command(after_help = "Example: dvs create my_volume my_volume.tar.gz")]
    Create {
        /// Volume to snapshot
        source_volume: String,

        /// Archive to write (.tar, .tar.gz, .tgz, .tar.bz2, .tar.xz)
        destination_file: PathBuf,
    },

    /// Restore snapshot file to docker volume
    #[command(after_help = "Example: dvs restore my_volume.tar.gz my_volume")]
    Restore {
        /// Archive to read
        snapshot_file: PathBuf,

        /// Volume to restore into
        destination_volume: String,
    },
}
