//! The fault being handled.

use chrono::{DateTime, Utc};

/// Number of host general-purpose registers recorded.
pub const NUM_HOST_GPRS: usize = 16;

/// Register names, padded to three characters, in [`HostRegisters::gpr`] order.
#[cfg(target_arch = "aarch64")]
pub const HOST_GPR_NAMES: [&str; NUM_HOST_GPRS] = [
    "X0 ", "X1 ", "X2 ", "X3 ", "X4 ", "X5 ", "X6 ", "X7 ", "X8 ", "X9 ", "X10", "X11", "X12",
    "FP ", "LR ", "SP ",
];

/// Register names, padded to three characters, in [`HostRegisters::gpr`] order.
#[cfg(not(target_arch = "aarch64"))]
pub const HOST_GPR_NAMES: [&str; NUM_HOST_GPRS] = [
    "RAX", "RBX", "RCX", "RDX", "RSP", "RBP", "RDI", "RSI", "R8 ", "R9 ", "R10", "R11", "R12",
    "R13", "R14", "R15",
];

#[cfg(target_arch = "aarch64")]
const STACK_POINTER_INDEX: usize = 15;
#[cfg(not(target_arch = "aarch64"))]
const STACK_POINTER_INDEX: usize = 4;

/// Host register state at the fault.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostRegisters {
    pub gpr: [u64; NUM_HOST_GPRS],
    pub ip: u64,
}

impl HostRegisters {
    #[must_use]
    pub const fn stack_pointer(&self) -> u64 {
        self.gpr[STACK_POINTER_INDEX]
    }

    /// Dump lines, four registers per line: `RAX=0000000000000000 RBX=...`.
    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        HOST_GPR_NAMES
            .chunks(4)
            .zip(self.gpr.chunks(4))
            .map(|(names, values)| {
                names
                    .iter()
                    .zip(values)
                    .map(|(name, value)| format!("{name}={value:016x}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
    }
}

/// A fault captured by a fault hook. Created once, never mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrashEvent {
    /// Platform fault code (the signal number on Unix).
    pub code: u32,
    /// Data address reported with the fault.
    pub address: u64,
    pub registers: HostRegisters,
    pub timestamp: DateTime<Utc>,
    /// OS id of the faulting thread.
    pub thread_id: u64,
}

impl CrashEvent {
    /// Event stamped with the current time and thread.
    #[must_use]
    pub fn new(code: u32, address: u64, registers: HostRegisters) -> Self {
        Self {
            code,
            address,
            registers,
            timestamp: Utc::now(),
            thread_id: current_thread_id(),
        }
    }

    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Symbolic name of the fault code, when it is a known signal.
    #[must_use]
    pub fn signal_name(&self) -> Option<&'static str> {
        #[cfg(unix)]
        {
            let raw = i32::try_from(self.code).ok()?;
            nix::sys::signal::Signal::try_from(raw)
                .ok()
                .map(nix::sys::signal::Signal::as_str)
        }
        #[cfg(not(unix))]
        {
            None
        }
    }
}

#[cfg(target_os = "linux")]
fn current_thread_id() -> u64 {
    // gettid is async-signal-safe and cannot fail.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    u64::try_from(tid).unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
const fn current_thread_id() -> u64 {
    0
}
