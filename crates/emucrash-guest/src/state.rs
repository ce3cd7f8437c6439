//! Guest state capability consumed by the crash handler.

use parking_lot::RwLock;

use crate::cpu::{ActiveCpu, GuestCpuSnapshot};
use crate::memory::{GuestAddressSpace, GuestMemory};
use crate::thread::{GuestThreadEntry, ThreadTable};

/// Identity of the guest title that is running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TitleInfo {
    pub name: String,
    pub title_id: u64,
    /// Hash of the title's main executable.
    pub content_hash: u32,
}

/// Read-only, best-effort view of the emulator for crash reporting.
///
/// Every method must be callable from a fault handler: no blocking, no
/// panics on inconsistent state.
pub trait GuestStateProvider: Send + Sync {
    /// The running title, or `None` when nothing is running.
    fn title(&self) -> Option<TitleInfo>;

    /// Registers of the CPU currently executing guest code, if any.
    fn current_cpu(&self) -> Option<GuestCpuSnapshot>;

    /// Number of rows in the guest thread table.
    fn thread_count(&self) -> usize;

    /// Row `index`, or `None` if the table shrank since `thread_count`.
    fn thread(&self, index: usize) -> Option<GuestThreadEntry>;

    /// Guest address space.
    fn memory(&self) -> &dyn GuestMemory;
}

/// Emulator-owned guest state.
pub struct GuestState {
    memory: GuestAddressSpace,
    cpu: ActiveCpu,
    threads: ThreadTable,
    title: RwLock<Option<TitleInfo>>,
}

impl GuestState {
    pub fn new(memory: GuestAddressSpace) -> Self {
        Self::with_threads(memory, ThreadTable::new())
    }

    pub fn with_threads(memory: GuestAddressSpace, threads: ThreadTable) -> Self {
        Self {
            memory,
            cpu: ActiveCpu::new(),
            threads,
            title: RwLock::new(None),
        }
    }

    pub const fn address_space(&self) -> &GuestAddressSpace {
        &self.memory
    }

    pub const fn address_space_mut(&mut self) -> &mut GuestAddressSpace {
        &mut self.memory
    }

    pub const fn cpu(&self) -> &ActiveCpu {
        &self.cpu
    }

    pub const fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    /// Set or clear the running title.
    pub fn set_title(&self, title: Option<TitleInfo>) {
        *self.title.write() = title;
    }
}

impl GuestStateProvider for GuestState {
    fn title(&self) -> Option<TitleInfo> {
        // A writer holding the lock at fault time reads as "not running".
        self.title.try_read().and_then(|title| title.clone())
    }

    fn current_cpu(&self) -> Option<GuestCpuSnapshot> {
        self.cpu.snapshot()
    }

    fn thread_count(&self) -> usize {
        self.threads.len()
    }

    fn thread(&self, index: usize) -> Option<GuestThreadEntry> {
        self.threads
            .record_unsynchronized(index)
            .map(|record| record.resolve(&self.memory))
    }

    fn memory(&self) -> &dyn GuestMemory {
        &self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{ThreadRecord, ThreadState};

    const BASE: u32 = 0x1000_0000;

    fn state() -> GuestState {
        let mut memory = GuestAddressSpace::new(BASE, 1 << 16).expect("allocation should succeed");
        memory
            .write_bytes(BASE + 0x40, b"MainThread\0")
            .expect("in bounds");
        GuestState::new(memory)
    }

    #[test]
    fn test_idle_state() {
        let state = state();
        assert_eq!(state.title(), None);
        assert_eq!(state.current_cpu(), None);
        assert_eq!(state.thread_count(), 0);
        assert_eq!(state.thread(0), None);
    }

    #[test]
    fn test_provider_view() {
        let state = state();
        state.set_title(Some(TitleInfo {
            name: "Demo".into(),
            title_id: 0x0005_0000_1010_1010,
            content_hash: 0x1234_5678,
        }));
        state
            .threads()
            .register(ThreadRecord::new(BASE + 0x100, 0x0200_0000).with_name_ptr(BASE + 0x40))
            .expect("fits");
        state
            .threads()
            .update(BASE + 0x100, |r| r.state = ThreadState::Running as u8)
            .expect("registered");
        state.cpu().set_gpr(1, BASE + 0x8000);
        state.cpu().activate(BASE + 0x100);

        assert_eq!(state.title().map(|t| t.name), Some("Demo".to_string()));
        let cpu = state.current_cpu().expect("active");
        assert_eq!(cpu.thread, BASE + 0x100);
        assert_eq!(cpu.stack_pointer(), BASE + 0x8000);

        let thread = state.thread(0).expect("registered");
        assert_eq!(thread.name.as_deref(), Some("MainThread"));
        assert_eq!(thread.display_state(), "RUNNING");
        assert!(state.memory().is_range_accessible(BASE, 32));
    }

    #[test]
    fn test_title_busy_reads_as_none() {
        let state = state();
        state.set_title(Some(TitleInfo {
            name: "Demo".into(),
            title_id: 1,
            content_hash: 2,
        }));
        let _writer = state.title.write();
        assert_eq!(GuestStateProvider::title(&state), None);
    }
}
