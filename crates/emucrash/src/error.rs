use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Crash handling errors.
///
/// None of these abort a crash sequence; the coordinator reports them as a
/// diagnostic line and moves on to the next step.
#[derive(Error, Debug)]
pub enum CrashError {
    #[error("failed to create snapshot directory {}: {source}", path.display())]
    SnapshotDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create snapshot file {}: {source}", path.display())]
    SnapshotOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write snapshot {}: {source}", path.display())]
    SnapshotWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to copy log {} to {}: {source}", from.display(), to.display())]
    LogCopy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("log sink is not backed by a file")]
    NoLogFile,
    #[error("failed to install fault hook for {signal}: {source}")]
    HookInstall {
        signal: &'static str,
        #[source]
        source: nix::Error,
    },
    #[error("{hook} hook already routes to another callback")]
    AlreadyInstalled { hook: &'static str },
    #[error("guest memory error: {0}")]
    GuestMemory(#[from] emucrash_guest::MemoryError),
    #[error("guest thread table error: {0}")]
    ThreadTable(#[from] emucrash_guest::ThreadTableError),
}

pub type Result<T> = std::result::Result<T, CrashError>;
