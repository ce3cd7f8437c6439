//! Crash capture for emulator hosts.
//!
//! On the first unhandled fault the [`CrashCoordinator`] writes one crash log
//! combining host state (native stack, registers) with guest state (title,
//! active CPU, guest stack, guest threads), optionally saves a snapshot, and
//! ends the process.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use emucrash::{CrashConfig, CrashCoordinator, FileLogSink, SignalFaultSource};
//!
//! let config = CrashConfig::default();
//! let sink = Arc::new(FileLogSink::new(config.log_path.clone()));
//! let coordinator = Arc::new(CrashCoordinator::new(config, sink));
//! coordinator.install(&SignalFaultSource::new())?;
//! # Ok::<(), emucrash::CrashError>(())
//! ```

pub mod config;
pub mod coordinator;
mod error;
pub mod event;
pub mod fault;
pub mod guest_dump;
pub mod native_stack;
pub mod sink;
pub mod snapshot;
pub mod terminate;

pub use config::{AppIdentity, CrashConfig};
pub use coordinator::{CoordinatorState, CrashCoordinator, CrashReport, SingleShotGate};
pub use error::{CrashError, Result};
pub use event::{CrashEvent, HostRegisters};
#[cfg(unix)]
pub use fault::SignalFaultSource;
pub use fault::{FaultCallback, FaultSource, ManualFaultSource};
pub use guest_dump::GuestDumper;
pub use native_stack::{NativeFrame, NativeStackWalker};
pub use sink::{FileLogSink, LogSink, MemoryLogSink};
pub use snapshot::{SnapshotBackend, SnapshotLevel, SnapshotWriter};
pub use terminate::{Termination, TerminationPolicy, Terminator};

pub use emucrash_guest as guest;
