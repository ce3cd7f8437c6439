//! CLI definitions and argument types.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use emucrash::{SnapshotLevel, TerminationPolicy};

/// Exit code for success.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for failure.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Parser)]
#[command(name = "emucrash")]
#[command(about = "Crash capture for emulator hosts - native and guest state in one crash log")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output (sets RUST_LOG=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output (only show errors)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub silent: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Simulate a fault in a demo guest and print the crash log
    Preview {
        /// Directory for log.txt and crashdump/ when a snapshot is requested
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Snapshot level
        #[arg(long, value_enum, default_value = "disabled")]
        snapshot: SnapshotArg,

        /// Leave the guest CPU idle (no guest stack sections)
        #[arg(long)]
        idle_cpu: bool,

        /// Crash without any guest attached
        #[arg(long, conflicts_with = "idle_cpu")]
        no_guest: bool,
    },
    /// Install the signal hooks and raise a real SIGSEGV
    Crash {
        /// Directory for log.txt and crashdump/
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Snapshot level
        #[arg(long, value_enum, default_value = "partial")]
        snapshot: SnapshotArg,

        /// How the process exits once the log is written
        #[arg(long, value_enum, default_value = "clean")]
        termination: TerminationArg,

        /// Force termination if this shared object is loaded (repeatable)
        #[arg(long = "forced-if-loaded", value_name = "LIB")]
        forced_if_loaded: Vec<String>,
    },
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum SnapshotArg {
    #[default]
    Disabled,
    Partial,
    Full,
}

impl From<SnapshotArg> for SnapshotLevel {
    fn from(arg: SnapshotArg) -> Self {
        match arg {
            SnapshotArg::Disabled => Self::Disabled,
            SnapshotArg::Partial => Self::Partial,
            SnapshotArg::Full => Self::Full,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum TerminationArg {
    /// Normal exit
    #[default]
    Clean,
    /// Immediate _exit
    Forced,
}

impl TerminationArg {
    /// Policy for this flag; any `--forced-if-loaded` entries take precedence
    /// over `clean`.
    pub fn policy(self, forced_if_loaded: &[String]) -> TerminationPolicy {
        match self {
            Self::Forced => TerminationPolicy::Forced,
            Self::Clean if forced_if_loaded.is_empty() => TerminationPolicy::Clean,
            Self::Clean => TerminationPolicy::ForcedIfLoaded(forced_if_loaded.to_vec()),
        }
    }
}
