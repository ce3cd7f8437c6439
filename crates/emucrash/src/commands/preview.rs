//! Preview command.

use std::path::Path;
use std::sync::Arc;

use emucrash::event::HostRegisters;
use emucrash::guest::GuestStateProvider;
use emucrash::{
    CrashConfig, CrashCoordinator, CrashEvent, FileLogSink, LogSink, ManualFaultSource,
    MemoryLogSink, SnapshotLevel, Termination, Terminator,
};
use tracing::{error, info};

use crate::cli::{EXIT_FAILURE, EXIT_SUCCESS};
use crate::demo;

/// Reports the termination instead of exiting.
struct PreviewTerminator;

impl Terminator for PreviewTerminator {
    fn terminate(&self, mode: Termination) {
        info!(?mode, "process would terminate here");
    }
}

/// Host registers that look like a fault in this function.
#[inline(never)]
fn simulated_registers() -> HostRegisters {
    let marker = 0u64;
    let mut registers = HostRegisters::default();
    for (i, value) in registers.gpr.iter_mut().enumerate() {
        *value = 0x1111_0000_0000_0000 | i as u64;
    }
    let this: fn() -> HostRegisters = simulated_registers;
    registers.ip = this as usize as u64;
    #[cfg(target_arch = "aarch64")]
    let sp_index = 15;
    #[cfg(not(target_arch = "aarch64"))]
    let sp_index = 4;
    registers.gpr[sp_index] = std::ptr::addr_of!(marker) as u64;
    registers
}

/// Handle the `preview` command.
pub fn cmd_preview(dir: &Path, snapshot: SnapshotLevel, idle_cpu: bool, no_guest: bool) -> i32 {
    let config = CrashConfig::rooted_at(dir).with_snapshot_level(snapshot);

    // The log copy needs a real file; otherwise keep everything in memory.
    let memory_sink = Arc::new(MemoryLogSink::new());
    let sink: Arc<dyn LogSink> = if snapshot == SnapshotLevel::Disabled {
        Arc::clone(&memory_sink) as Arc<dyn LogSink>
    } else {
        Arc::new(FileLogSink::new(config.log_path.clone()))
    };

    let mut coordinator = CrashCoordinator::new(config.clone(), Arc::clone(&sink))
        .with_terminator(Arc::new(PreviewTerminator));
    if !no_guest {
        match demo::build(!idle_cpu) {
            Ok(guest) => {
                let guest: Arc<dyn GuestStateProvider> = Arc::new(guest);
                coordinator = coordinator.with_guest(guest);
            }
            Err(e) => {
                error!(error = %e, "failed to build demo guest");
                return EXIT_FAILURE;
            }
        }
    }
    let coordinator = Arc::new(coordinator);

    let source = ManualFaultSource::new();
    if let Err(e) = coordinator.install(&source) {
        error!(error = %e, "failed to install fault source");
        return EXIT_FAILURE;
    }
    let event = CrashEvent::new(libc::SIGSEGV.unsigned_abs(), 0xdead_beef, simulated_registers());
    source.raise(&event);

    let text = match sink.path() {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to read crash log");
                return EXIT_FAILURE;
            }
        },
        None => memory_sink.contents(),
    };
    print!("{text}");

    if snapshot != SnapshotLevel::Disabled {
        info!(dir = %config.dump_dir.display(), "snapshot and log copy written");
    }
    EXIT_SUCCESS
}
