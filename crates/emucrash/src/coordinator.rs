//! Crash sequence orchestration.
//!
//! A [`CrashCoordinator`] handles at most one fault per process. The first
//! fault wins the [`SingleShotGate`]; every later or concurrent one is
//! dropped without touching the log. Each step of the sequence is isolated,
//! so a step that panics only loses its own section.

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use emucrash_guest::GuestStateProvider;
use tracing::{debug, warn};

use crate::config::CrashConfig;
use crate::error::{CrashError, Result};
use crate::event::CrashEvent;
use crate::fault::FaultSource;
use crate::guest_dump::GuestDumper;
use crate::native_stack::{NativeStackWalker, executable_image};
use crate::sink::{LogSink, write_section_header};
use crate::snapshot::{SnapshotBackend, SnapshotWriter, artifact_file_name};
use crate::terminate::{ProcessTerminator, Termination, Terminator};

/// Lifecycle of the crash handler.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle = 0,
    Handling = 1,
    Terminated = 2,
}

impl CoordinatorState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Handling,
            _ => Self::Terminated,
        }
    }
}

/// Lets exactly one caller through.
#[derive(Debug)]
pub struct SingleShotGate {
    state: AtomicU8,
}

impl Default for SingleShotGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleShotGate {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(CoordinatorState::Idle as u8),
        }
    }

    /// Move `Idle -> Handling`. Only the first caller gets `true`.
    pub fn try_enter(&self) -> bool {
        self.state
            .compare_exchange(
                CoordinatorState::Idle as u8,
                CoordinatorState::Handling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn finish(&self) {
        self.state
            .store(CoordinatorState::Terminated as u8, Ordering::Release);
    }

    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::from_raw(self.state.load(Ordering::Acquire))
    }
}

/// Outcome of a handled fault.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrashReport {
    pub snapshot: Option<PathBuf>,
    pub log_copy: Option<PathBuf>,
    pub termination: Termination,
}

/// Address of a local in the caller's frame.
fn stack_canary(canary: &u8) -> u64 {
    std::hint::black_box(std::ptr::from_ref(canary)) as usize as u64
}

/// Run `f`, turning a panic into `None`.
fn best_effort<T>(step: &'static str, f: impl FnOnce() -> T) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(step, "crash handling step panicked");
            None
        }
    }
}

pub struct CrashCoordinator {
    config: CrashConfig,
    sink: Arc<dyn LogSink>,
    guest: Option<Arc<dyn GuestStateProvider>>,
    snapshots: SnapshotWriter,
    walker: NativeStackWalker,
    dumper: GuestDumper,
    terminator: Arc<dyn Terminator>,
    gate: SingleShotGate,
}

impl CrashCoordinator {
    pub fn new(config: CrashConfig, sink: Arc<dyn LogSink>) -> Self {
        Self {
            snapshots: SnapshotWriter::new(config.dump_dir.clone(), config.snapshot_level),
            walker: NativeStackWalker::new(config.native_frames),
            dumper: GuestDumper::from_config(&config),
            terminator: Arc::new(ProcessTerminator),
            gate: SingleShotGate::new(),
            guest: None,
            config,
            sink,
        }
    }

    /// Attach the emulator's guest state.
    #[must_use]
    pub fn with_guest(mut self, guest: Arc<dyn GuestStateProvider>) -> Self {
        self.guest = Some(guest);
        self
    }

    #[must_use]
    pub fn with_snapshot_backend(mut self, backend: Box<dyn SnapshotBackend>) -> Self {
        self.snapshots = SnapshotWriter::with_backend(
            self.config.dump_dir.clone(),
            self.config.snapshot_level,
            backend,
        );
        self
    }

    #[must_use]
    pub fn with_stack_walker(mut self, walker: NativeStackWalker) -> Self {
        self.walker = walker;
        self
    }

    #[must_use]
    pub fn with_terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = terminator;
        self
    }

    pub const fn config(&self) -> &CrashConfig {
        &self.config
    }

    pub fn state(&self) -> CoordinatorState {
        self.gate.state()
    }

    /// Route faults from `source` into this coordinator.
    ///
    /// # Errors
    ///
    /// Propagates hook installation failures from the source.
    pub fn install(self: &Arc<Self>, source: &dyn FaultSource) -> Result<()> {
        let coordinator = Arc::clone(self);
        source.on_fault(Arc::new(move |event: &CrashEvent| coordinator.on_fault(event)))?;
        debug!(
            dump_dir = %self.config.dump_dir.display(),
            snapshot = ?self.config.snapshot_level,
            "crash handler installed"
        );
        Ok(())
    }

    /// Handle `event` and end the process. Returns only if the fault was
    /// dropped, or if the terminator does not exit.
    #[inline(never)]
    pub fn on_fault(&self, event: &CrashEvent) {
        let canary = 0u8;
        if let Some(report) = self.run(event, stack_canary(&canary)) {
            self.terminator.terminate(report.termination);
        }
    }

    /// Run the crash sequence for `event` without terminating.
    ///
    /// Returns `None` when another fault already owns the gate.
    #[inline(never)]
    pub fn handle_fault(&self, event: &CrashEvent) -> Option<CrashReport> {
        let canary = 0u8;
        std::hint::black_box(self.run(event, stack_canary(&canary)))
    }

    /// The crash sequence. Native frames at or below `canary` belong to the
    /// handler and are left out of the stack trace.
    fn run(&self, event: &CrashEvent, canary: u64) -> Option<CrashReport> {
        if !self.gate.try_enter() {
            return None;
        }
        let sink = self.sink.as_ref();
        let guest = self.guest.as_deref();

        best_effort("create log", || {
            if let Err(e) = sink.ensure_created(true) {
                warn!(error = %e, "couldn't create crash log");
            }
        });

        let snapshot = best_effort("snapshot", || match self.snapshots.write(event) {
            Ok(path) => path,
            Err(e) => {
                sink.write_line(&format!("couldn't write snapshot: {e}"), false, true);
                None
            }
        })
        .flatten();

        best_effort("header", || self.write_header(event));
        best_effort("stack trace", || self.write_native_stack(event, canary));
        best_effort("exception", || self.write_exception(event));
        best_effort("host registers", || self.write_host_registers(event));
        best_effort("guest info", || self.dumper.write_info(sink, guest));
        best_effort("guest threads", || self.dumper.write_threads(sink, guest));
        best_effort("flush", || sink.flush());

        let log_copy = snapshot.as_deref().and_then(|snapshot| {
            best_effort("log copy", || match self.copy_log(snapshot, event) {
                Ok(path) => Some(path),
                Err(e) => {
                    sink.write_line(&format!("couldn't copy log: {e}"), false, true);
                    sink.flush();
                    None
                }
            })
            .flatten()
        });

        let termination =
            best_effort("termination", || self.config.termination.resolve()).unwrap_or(Termination::Forced);
        self.gate.finish();

        Some(CrashReport {
            snapshot,
            log_copy,
            termination,
        })
    }

    fn write_header(&self, event: &CrashEvent) {
        let identity = &self.config.identity;
        self.sink.write_plain(&format!(
            "\nCrashlog for {} {}\n",
            identity.name, identity.version
        ));
        self.sink.write_plain(&format!(
            "Date: {}\n\n",
            event.timestamp.format("%d-%m-%Y %H:%M:%S")
        ));
    }

    fn write_native_stack(&self, event: &CrashEvent, canary: u64) {
        write_section_header(self.sink.as_ref(), "Stack trace");
        let addresses = self.walker.capture_from(event.registers.ip, canary);
        for frame in self.walker.frames(&addresses) {
            self.sink.write_line(&frame.to_string(), false, false);
        }
    }

    fn write_exception(&self, event: &CrashEvent) {
        let ip = event.registers.ip;
        let line = match self.walker.module_info(ip) {
            Some(module) => format!(
                "Exception 0x{:08x} at 0x{ip:x}(+0x{:x}) in module {}",
                event.code,
                ip.wrapping_sub(module.base),
                module.short_name()
            ),
            None => format!("Exception 0x{:08x} at 0x{ip:x}", event.code),
        };
        self.sink.write_line(&line, false, false);

        let signal = event
            .signal_name()
            .map(|name| format!(" ({name})"))
            .unwrap_or_default();
        self.sink.write_line(
            &format!("Fault address 0x{:x}{signal}", event.address),
            false,
            false,
        );

        if let Some(image) = executable_image() {
            self.sink.write_line(
                &format!("{} at 0x{:x}", image.short_name(), image.base),
                false,
                false,
            );
        }
    }

    fn write_host_registers(&self, event: &CrashEvent) {
        self.sink.write_plain("\n");
        write_section_header(self.sink.as_ref(), "Host registers");
        for line in event.registers.lines() {
            self.sink.write_line(&line, false, false);
        }
    }

    /// Copy the log file next to `snapshot` as `log_<timestamp>.txt`.
    fn copy_log(&self, snapshot: &Path, event: &CrashEvent) -> Result<PathBuf> {
        let from = self.sink.path().ok_or(CrashError::NoLogFile)?;
        let dir = snapshot.parent().unwrap_or(&self.config.dump_dir);
        let to = dir.join(artifact_file_name("log", "txt", event.timestamp));
        fs::copy(from, &to).map_err(|source| CrashError::LogCopy {
            from: from.to_path_buf(),
            to: to.clone(),
            source,
        })?;
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use emucrash_guest::{GuestCpuSnapshot, GuestMemory, GuestThreadEntry, TitleInfo};

    use super::*;
    use crate::event::HostRegisters;
    use crate::fault::ManualFaultSource;
    use crate::native_stack::NoSymbols;
    use crate::sink::MemoryLogSink;
    use crate::terminate::TerminationPolicy;

    #[derive(Default)]
    struct RecordingTerminator {
        calls: Mutex<Vec<Termination>>,
    }

    impl Terminator for RecordingTerminator {
        fn terminate(&self, mode: Termination) {
            self.calls.lock().expect("terminator lock").push(mode);
        }
    }

    struct PanickingGuest;

    impl GuestMemory for PanickingGuest {
        fn is_range_accessible(&self, _addr: u32, _len: u32) -> bool {
            false
        }

        fn read_u8(&self, _addr: u32) -> Option<u8> {
            None
        }

        fn read_u32(&self, _addr: u32) -> Option<u32> {
            None
        }
    }

    impl GuestStateProvider for PanickingGuest {
        fn title(&self) -> Option<TitleInfo> {
            panic!("title table corrupted");
        }

        fn current_cpu(&self) -> Option<GuestCpuSnapshot> {
            None
        }

        fn thread_count(&self) -> usize {
            0
        }

        fn thread(&self, _index: usize) -> Option<GuestThreadEntry> {
            None
        }

        fn memory(&self) -> &dyn GuestMemory {
            self
        }
    }

    fn coordinator(sink: Arc<MemoryLogSink>) -> CrashCoordinator {
        CrashCoordinator::new(CrashConfig::default(), sink).with_stack_walker(
            NativeStackWalker::with_resolvers(8, Arc::new(NoSymbols), Arc::new(NoSymbols)),
        )
    }

    fn event() -> CrashEvent {
        CrashEvent::new(11, 0x10, HostRegisters::default())
    }

    #[test]
    fn test_gate_transitions() {
        let gate = SingleShotGate::new();
        assert_eq!(gate.state(), CoordinatorState::Idle);
        assert!(gate.try_enter());
        assert_eq!(gate.state(), CoordinatorState::Handling);
        assert!(!gate.try_enter());
        gate.finish();
        assert_eq!(gate.state(), CoordinatorState::Terminated);
        assert!(!gate.try_enter());
    }

    #[test]
    fn test_second_fault_is_dropped() {
        let sink = Arc::new(MemoryLogSink::new());
        let coordinator = coordinator(Arc::clone(&sink));
        let report = coordinator.handle_fault(&event()).expect("first fault handled");
        assert_eq!(report.termination, Termination::Exit);
        assert_eq!(report.snapshot, None);
        assert_eq!(coordinator.state(), CoordinatorState::Terminated);

        let before = sink.contents();
        assert!(coordinator.handle_fault(&event()).is_none());
        assert_eq!(sink.contents(), before);
        assert_eq!(sink.creations(), 1);
    }

    #[test]
    fn test_installed_source_terminates_once() {
        let sink = Arc::new(MemoryLogSink::new());
        let terminator = Arc::new(RecordingTerminator::default());
        let coordinator = Arc::new(
            coordinator(Arc::clone(&sink))
                .with_terminator(Arc::clone(&terminator) as Arc<dyn Terminator>),
        );
        let source = ManualFaultSource::new();
        coordinator.install(&source).expect("install");

        assert!(source.raise(&event()));
        assert!(source.raise(&event()));
        assert_eq!(
            *terminator.calls.lock().expect("terminator lock"),
            vec![Termination::Exit]
        );
        assert!(sink.contents().contains("Crashlog for emucrash"));
    }

    #[test]
    fn test_panicking_step_does_not_stop_sequence() {
        let sink = Arc::new(MemoryLogSink::new());
        let config = CrashConfig::default().with_termination(TerminationPolicy::Forced);
        let coordinator = CrashCoordinator::new(config, Arc::clone(&sink) as Arc<dyn LogSink>)
            .with_stack_walker(NativeStackWalker::with_resolvers(
                4,
                Arc::new(NoSymbols),
                Arc::new(NoSymbols),
            ))
            .with_guest(Arc::new(PanickingGuest));

        let report = coordinator.handle_fault(&event()).expect("handled");
        assert_eq!(report.termination, Termination::Forced);
        let text = sink.contents();
        assert!(text.contains("Host registers"));
        assert!(!text.contains("Active guest CPU"));
        assert!(text.contains("Guest threads"));
        assert!(text.contains("None active"));
        assert_eq!(sink.flushes(), 1);
    }

    #[test]
    fn test_header_and_exception_lines() {
        let sink = Arc::new(MemoryLogSink::new());
        let coordinator = coordinator(Arc::clone(&sink));
        coordinator.handle_fault(&event()).expect("handled");
        let text = sink.contents();
        assert!(text.starts_with("\nCrashlog for emucrash "));
        assert!(text.contains("\nDate: "));
        assert!(text.contains("Exception 0x0000000b at 0x0\n"));
        assert!(text.contains("Fault address 0x10 (SIGSEGV)\n"));
    }
}
