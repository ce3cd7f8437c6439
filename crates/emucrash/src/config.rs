//! Crash handler configuration.

use std::path::{Path, PathBuf};

use crate::snapshot::SnapshotLevel;
use crate::terminate::TerminationPolicy;

/// Maximum native frames captured by default.
pub const DEFAULT_NATIVE_FRAMES: usize = 40;

/// 32-byte lines dumped from the guest stack by default.
pub const DEFAULT_GUEST_STACK_LINES: usize = 16;

/// Guest back-chain frames followed by default.
pub const DEFAULT_GUEST_BACKCHAIN_DEPTH: usize = 32;

/// Name and version printed in the crash log header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppIdentity {
    pub name: String,
    pub version: String,
}

impl AppIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl Default for AppIdentity {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }
}

/// Crash handler configuration.
#[derive(Clone, Debug)]
pub struct CrashConfig {
    /// Directory receiving snapshots and log copies.
    pub dump_dir: PathBuf,
    /// Path of the log file written by [`FileLogSink`](crate::FileLogSink).
    pub log_path: PathBuf,
    /// How much process state to snapshot.
    pub snapshot_level: SnapshotLevel,
    /// Identity shown in the log header.
    pub identity: AppIdentity,
    /// How the process ends once the log is written.
    pub termination: TerminationPolicy,
    /// Maximum native stack depth.
    pub native_frames: usize,
    /// Guest stack lines to dump.
    pub guest_stack_lines: usize,
    /// Guest back-chain frames to follow.
    pub guest_backchain_depth: usize,
}

impl Default for CrashConfig {
    fn default() -> Self {
        Self {
            dump_dir: PathBuf::from("crashdump"),
            log_path: PathBuf::from("log.txt"),
            snapshot_level: SnapshotLevel::Disabled,
            identity: AppIdentity::default(),
            termination: TerminationPolicy::Clean,
            native_frames: DEFAULT_NATIVE_FRAMES,
            guest_stack_lines: DEFAULT_GUEST_STACK_LINES,
            guest_backchain_depth: DEFAULT_GUEST_BACKCHAIN_DEPTH,
        }
    }
}

impl CrashConfig {
    /// Config rooted at an install/user directory: `<dir>/crashdump` and
    /// `<dir>/log.txt`.
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            dump_dir: dir.join("crashdump"),
            log_path: dir.join("log.txt"),
            ..Default::default()
        }
    }

    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = dir.into();
        self
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }

    pub const fn with_snapshot_level(mut self, level: SnapshotLevel) -> Self {
        self.snapshot_level = level;
        self
    }

    pub fn with_identity(mut self, identity: AppIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_termination(mut self, policy: TerminationPolicy) -> Self {
        self.termination = policy;
        self
    }

    pub const fn with_native_frames(mut self, frames: usize) -> Self {
        self.native_frames = frames;
        self
    }
}
