//! Crash snapshots.
//!
//! The writer owns naming and file creation; what goes into the file is up to
//! a [`SnapshotBackend`].

#[cfg(target_os = "linux")]
mod procfs;

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{CrashError, Result};
use crate::event::CrashEvent;

#[cfg(target_os = "linux")]
pub use procfs::{MapEntry, ProcfsSnapshot, SNAPSHOT_MAGIC, SNAPSHOT_VERSION, StreamKind};

/// How much process state to capture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SnapshotLevel {
    #[default]
    Disabled,
    /// Memory map plus memory around live register values and the stack.
    Partial,
    /// All private writable memory, threads and modules.
    Full,
}

impl SnapshotLevel {
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Disabled => 0,
            Self::Partial => 1,
            Self::Full => 2,
        }
    }
}

/// Input handed to a backend.
#[derive(Clone, Copy, Debug)]
pub struct SnapshotRequest<'a> {
    pub level: SnapshotLevel,
    pub event: &'a CrashEvent,
}

/// Produces snapshot contents.
pub trait SnapshotBackend: Send + Sync {
    /// File extension, without the dot.
    fn extension(&self) -> &'static str {
        "dmp"
    }

    /// Write the snapshot for `request` to `out`.
    ///
    /// # Errors
    ///
    /// Returns the first I/O error that prevents a usable snapshot.
    fn write_snapshot(&self, out: &mut dyn Write, request: &SnapshotRequest<'_>) -> io::Result<()>;
}

/// Backend for platforms without a snapshot format.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnsupportedSnapshot;

impl SnapshotBackend for UnsupportedSnapshot {
    fn write_snapshot(&self, _out: &mut dyn Write, _request: &SnapshotRequest<'_>) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "snapshots are not supported on this platform",
        ))
    }
}

/// Best backend for the current platform.
pub fn default_backend() -> Box<dyn SnapshotBackend> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcfsSnapshot::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(UnsupportedSnapshot)
    }
}

/// Artifact name: `<kind>_YYYYMMDD_HHMMSS.<ext>` in UTC.
pub fn artifact_file_name(kind: &str, extension: &str, timestamp: DateTime<Utc>) -> String {
    format!("{kind}_{}.{extension}", timestamp.format("%Y%m%d_%H%M%S"))
}

/// Creates snapshot files in the dump directory.
pub struct SnapshotWriter {
    dir: PathBuf,
    level: SnapshotLevel,
    backend: Box<dyn SnapshotBackend>,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>, level: SnapshotLevel) -> Self {
        Self::with_backend(dir, level, default_backend())
    }

    pub fn with_backend(
        dir: impl Into<PathBuf>,
        level: SnapshotLevel,
        backend: Box<dyn SnapshotBackend>,
    ) -> Self {
        Self {
            dir: dir.into(),
            level,
            backend,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub const fn level(&self) -> SnapshotLevel {
        self.level
    }

    /// Write a snapshot for `event`.
    ///
    /// Returns `Ok(None)` without touching the filesystem when snapshots are
    /// disabled. A partially written file is left in place on error.
    ///
    /// # Errors
    ///
    /// Directory creation, file creation and backend failures.
    pub fn write(&self, event: &CrashEvent) -> Result<Option<PathBuf>> {
        if self.level == SnapshotLevel::Disabled {
            return Ok(None);
        }

        fs::create_dir_all(&self.dir).map_err(|source| CrashError::SnapshotDirectory {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.dir.join(artifact_file_name(
            "crash",
            self.backend.extension(),
            event.timestamp,
        ));
        let file = File::create(&path).map_err(|source| CrashError::SnapshotOpen {
            path: path.clone(),
            source,
        })?;

        let mut out = BufWriter::new(file);
        let request = SnapshotRequest {
            level: self.level,
            event,
        };
        self.backend
            .write_snapshot(&mut out, &request)
            .and_then(|()| out.flush())
            .map_err(|source| CrashError::SnapshotWrite {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), level = ?self.level, "snapshot written");
        Ok(Some(path))
    }
}
