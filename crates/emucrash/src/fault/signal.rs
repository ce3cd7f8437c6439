//! POSIX signal fault source.
//!
//! Crash signals are blocked while a handler runs (no `SA_NODEFER`), so a
//! second fault on the handling thread is fatal instead of recursive. The
//! handlers run on the faulting thread's own stack; a stack overflow falls
//! through to the default action.

use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{FaultCallback, FaultSource};
use crate::error::{CrashError, Result};
use crate::event::{CrashEvent, HostRegisters};

/// Signals treated as crashes.
pub const CRASH_SIGNALS: [Signal; 4] = [
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGILL,
    Signal::SIGFPE,
];

/// Breakpoint or single-step trap forwarded to a debugger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebugEvent {
    /// Instruction pointer at the trap.
    pub address: u64,
    /// `si_code` of the trap.
    pub code: i32,
}

pub type DebugCallback = Arc<dyn Fn(&DebugEvent) + Send + Sync>;

static CRASH_CALLBACK: OnceLock<FaultCallback> = OnceLock::new();
static DEBUG_CALLBACK: OnceLock<DebugCallback> = OnceLock::new();
static PREVIOUS_ACTIONS: OnceLock<Vec<(Signal, SigAction)>> = OnceLock::new();
static PREVIOUS_TRAP: OnceLock<SigAction> = OnceLock::new();
static INSTALL: Mutex<()> = Mutex::new(());

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn registers_from_context(context: *mut c_void) -> HostRegisters {
    if context.is_null() {
        return HostRegisters::default();
    }
    // SAFETY: the kernel passes a ucontext_t to SA_SIGINFO handlers.
    let gregs = unsafe { &(*context.cast::<libc::ucontext_t>()).uc_mcontext.gregs };
    let order = [
        libc::REG_RAX,
        libc::REG_RBX,
        libc::REG_RCX,
        libc::REG_RDX,
        libc::REG_RSP,
        libc::REG_RBP,
        libc::REG_RDI,
        libc::REG_RSI,
        libc::REG_R8,
        libc::REG_R9,
        libc::REG_R10,
        libc::REG_R11,
        libc::REG_R12,
        libc::REG_R13,
        libc::REG_R14,
        libc::REG_R15,
    ];
    let mut regs = HostRegisters::default();
    for (slot, reg) in regs.gpr.iter_mut().zip(order) {
        *slot = gregs[reg as usize] as u64;
    }
    regs.ip = gregs[libc::REG_RIP as usize] as u64;
    regs
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn registers_from_context(context: *mut c_void) -> HostRegisters {
    if context.is_null() {
        return HostRegisters::default();
    }
    // SAFETY: the kernel passes a ucontext_t to SA_SIGINFO handlers.
    let mcontext = unsafe { &(*context.cast::<libc::ucontext_t>()).uc_mcontext };
    let mut regs = HostRegisters::default();
    regs.gpr[..13].copy_from_slice(&mcontext.regs[..13]);
    regs.gpr[13] = mcontext.regs[29];
    regs.gpr[14] = mcontext.regs[30];
    regs.gpr[15] = mcontext.sp;
    regs.ip = mcontext.pc;
    regs
}

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
const unsafe fn registers_from_context(_context: *mut c_void) -> HostRegisters {
    HostRegisters {
        gpr: [0; crate::event::NUM_HOST_GPRS],
        ip: 0,
    }
}

#[cfg(target_os = "linux")]
unsafe fn instruction_pointer(context: *mut c_void) -> u64 {
    // SAFETY: forwarded from the caller.
    unsafe { registers_from_context(context) }.ip
}

/// Put back whatever was installed before us for `signum`.
fn restore_previous(signum: libc::c_int) {
    let Ok(signal) = Signal::try_from(signum) else {
        return;
    };
    let previous = if signal == Signal::SIGTRAP {
        PREVIOUS_TRAP.get().copied()
    } else {
        PREVIOUS_ACTIONS
            .get()
            .and_then(|actions| actions.iter().find(|(s, _)| *s == signal))
            .map(|(_, action)| *action)
    };
    let action = previous
        .unwrap_or_else(|| SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty()));
    // SAFETY: reinstalling a handler that was valid when we replaced it.
    let _ = unsafe { sigaction(signal, &action) };
}

extern "C" fn crash_handler(signum: libc::c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let Some(callback) = CRASH_CALLBACK.get() else {
        // Returning re-executes the faulting instruction under the old action.
        restore_previous(signum);
        return;
    };

    let address = if info.is_null() {
        0
    } else {
        // SAFETY: the kernel fills siginfo for SA_SIGINFO handlers.
        unsafe { (*info).si_addr() as usize as u64 }
    };
    // SAFETY: `context` comes straight from the kernel.
    let registers = unsafe { registers_from_context(context) };
    let event = CrashEvent::new(signum.unsigned_abs(), address, registers);
    callback(&event);

    // Only reached when the fault was dropped; another thread is ending the
    // process.
    loop {
        // SAFETY: pause has no preconditions.
        unsafe { libc::pause() };
    }
}

extern "C" fn debug_handler(signum: libc::c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let Some(callback) = DEBUG_CALLBACK.get() else {
        restore_previous(signum);
        return;
    };
    // SAFETY: the kernel fills siginfo for SA_SIGINFO handlers.
    let code = if info.is_null() { 0 } else { unsafe { (*info).si_code } };
    #[cfg(target_os = "linux")]
    // SAFETY: `context` comes straight from the kernel.
    let address = unsafe { instruction_pointer(context) };
    #[cfg(not(target_os = "linux"))]
    let address = {
        let _ = context;
        0
    };
    callback(&DebugEvent { address, code });
}

fn crash_mask() -> SigSet {
    let mut mask = SigSet::empty();
    for signal in CRASH_SIGNALS {
        mask.add(signal);
    }
    mask
}

/// Forward `SIGTRAP` to `callback`, then resume the trapping thread.
///
/// Only the first callback is kept.
///
/// # Errors
///
/// [`CrashError::HookInstall`] if `sigaction` fails.
pub fn install_debug_forwarder(callback: DebugCallback) -> Result<()> {
    let _guard = INSTALL.lock();
    if DEBUG_CALLBACK.set(callback).is_err() {
        warn!("debug trap forwarder already set, keeping the first callback");
    }
    if PREVIOUS_TRAP.get().is_some() {
        return Ok(());
    }
    let action = SigAction::new(
        SigHandler::SigAction(debug_handler),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: debug_handler only reads statics and calls the callback.
    let previous = unsafe { sigaction(Signal::SIGTRAP, &action) }.map_err(|source| {
        CrashError::HookInstall {
            signal: Signal::SIGTRAP.as_str(),
            source,
        }
    })?;
    let _ = PREVIOUS_TRAP.set(previous);
    debug!("debug trap forwarder installed");
    Ok(())
}

/// The crash handler serves one coordinator for the life of the process.
fn register_crash_callback(callback: FaultCallback) -> Result<()> {
    CRASH_CALLBACK
        .set(callback)
        .map_err(|_| CrashError::AlreadyInstalled { hook: "crash" })
}

/// Hooks the crash signals of the whole process.
#[derive(Clone, Default)]
pub struct SignalFaultSource {
    debug: Option<DebugCallback>,
}

impl SignalFaultSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also forward debug traps to `callback`.
    #[must_use]
    pub fn with_debug_forwarder(mut self, callback: DebugCallback) -> Self {
        self.debug = Some(callback);
        self
    }
}

impl FaultSource for SignalFaultSource {
    fn on_fault(&self, callback: FaultCallback) -> Result<()> {
        {
            let _guard = INSTALL.lock();
            register_crash_callback(callback)?;
            if PREVIOUS_ACTIONS.get().is_none() {
                let action = SigAction::new(
                    SigHandler::SigAction(crash_handler),
                    SaFlags::SA_SIGINFO,
                    crash_mask(),
                );
                let mut previous = Vec::with_capacity(CRASH_SIGNALS.len());
                for signal in CRASH_SIGNALS {
                    // SAFETY: crash_handler is a valid SA_SIGINFO handler.
                    let old = unsafe { sigaction(signal, &action) }.map_err(|source| {
                        CrashError::HookInstall {
                            signal: signal.as_str(),
                            source,
                        }
                    })?;
                    previous.push((signal, old));
                }
                let _ = PREVIOUS_ACTIONS.set(previous);
                debug!(signals = ?CRASH_SIGNALS, "crash hooks installed");
            }
        }
        if let Some(debug) = &self.debug {
            install_debug_forwarder(Arc::clone(debug))?;
        }
        Ok(())
    }
}
