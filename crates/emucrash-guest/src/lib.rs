//! Guest machine state as seen from the host's crash handler.
//!
//! The emulator core owns a guest address space, a register file for the
//! CPU instance that is currently executing, and the guest OS thread table.
//! This crate keeps those three pieces in a form that can be read from a
//! fault handler without taking locks: register and thread fields are
//! atomics, guest memory reads are bounds-checked and never fault.
//!
//! The crash handler only sees the [`GuestStateProvider`] capability, so it
//! can be driven by the real [`GuestState`] or by a test double.
//!
//! ```ignore
//! use emucrash_guest::{GuestAddressSpace, GuestState, ThreadRecord};
//!
//! let memory = GuestAddressSpace::new(0x1000_0000, 1 << 20)?;
//! let state = GuestState::new(memory);
//! state.threads().register(ThreadRecord::new(0x1000_0100, 0x0200_0000))?;
//! state.cpu().activate(0x1000_0100);
//! ```

mod cpu;
mod memory;
mod state;
mod thread;

pub use cpu::{ActiveCpu, GuestCpuSnapshot, NUM_GPRS, STACK_POINTER_GPR};
pub use memory::{GUARD_SIZE, GuestAddressSpace, GuestMemory, MemoryError};
pub use state::{GuestState, GuestStateProvider, TitleInfo};
pub use thread::{
    GuestThreadEntry, MAX_THREAD_NAME, MAX_THREADS, ThreadRecord, ThreadState, ThreadTable,
    ThreadTableError,
};
