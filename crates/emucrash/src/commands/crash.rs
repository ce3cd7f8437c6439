//! Crash command.

use std::path::Path;
use std::sync::Arc;

use emucrash::guest::GuestStateProvider;
use emucrash::{
    CrashConfig, CrashCoordinator, FileLogSink, SignalFaultSource, SnapshotLevel,
    TerminationPolicy,
};
use nix::sys::signal::{Signal, raise};
use tracing::{error, info};

use crate::cli::EXIT_FAILURE;
use crate::demo;

/// Handle the `crash` command. Only returns on failure.
pub fn cmd_crash(dir: &Path, snapshot: SnapshotLevel, termination: TerminationPolicy) -> i32 {
    let config = CrashConfig::rooted_at(dir)
        .with_snapshot_level(snapshot)
        .with_termination(termination);
    let sink = Arc::new(FileLogSink::new(config.log_path.clone()));

    let guest: Arc<dyn GuestStateProvider> = match demo::build(true) {
        Ok(guest) => Arc::new(guest),
        Err(e) => {
            error!(error = %e, "failed to build demo guest");
            return EXIT_FAILURE;
        }
    };
    let coordinator = Arc::new(CrashCoordinator::new(config.clone(), sink).with_guest(guest));
    if let Err(e) = coordinator.install(&SignalFaultSource::new()) {
        error!(error = %e, "failed to install crash hooks");
        return EXIT_FAILURE;
    }

    info!(
        log = %config.log_path.display(),
        dump_dir = %config.dump_dir.display(),
        "raising SIGSEGV"
    );
    if let Err(e) = raise(Signal::SIGSEGV) {
        error!(error = %e, "failed to raise SIGSEGV");
    }
    error!("crash handler returned");
    EXIT_FAILURE
}
