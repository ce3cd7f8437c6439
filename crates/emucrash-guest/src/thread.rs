//! Guest OS thread table.
//!
//! The scheduler registers, updates and removes threads under the table's
//! exclusive lock. The crash handler must not lock, so every slot field is an
//! atomic and [`ThreadTable::record_unsynchronized`] reads them directly,
//! bounds-checked against the live count. A row read while the scheduler is
//! mid-update may be torn; that is accepted.

use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use emucrash_sync::SlimRwLock;
use thiserror::Error;

use crate::memory::GuestMemory;

/// Default number of thread slots.
pub const MAX_THREADS: usize = 256;

/// Longest thread name read from guest memory.
pub const MAX_THREAD_NAME: usize = 64;

/// Coarse scheduler state of a guest thread.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    None = 0,
    Ready = 1,
    Running = 2,
    Waiting = 4,
    Moribund = 8,
}

impl ThreadState {
    /// Decode a raw state byte. Values outside the enum yield `None`.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Ready),
            2 => Some(Self::Running),
            4 => Some(Self::Waiting),
            8 => Some(Self::Moribund),
            _ => None,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Moribund => "MORIBUND",
        }
    }
}

/// One row of the guest thread table with its name resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuestThreadEntry {
    /// Guest address of the thread object.
    pub handle: u32,
    pub entrypoint: u32,
    pub ip: u32,
    pub lr: u32,
    /// Raw coarse state; see [`ThreadState::from_raw`].
    pub state: u8,
    pub suspend_counter: i32,
    /// CPU affinity bitmask; bits 0..3 are meaningful.
    pub affinity: u8,
    pub priority: i32,
    pub name: Option<String>,
}

impl GuestThreadEntry {
    /// Label shown in crash logs.
    ///
    /// A nonzero suspend counter wins over the coarse state; unknown coarse
    /// states show as `UNDEFINED`.
    #[must_use]
    pub fn display_state(&self) -> &'static str {
        if self.suspend_counter != 0 {
            return "SUSPENDED";
        }
        ThreadState::from_raw(self.state).map_or("UNDEFINED", ThreadState::label)
    }

    /// Affinity bits for cores 0, 1 and 2.
    #[must_use]
    pub const fn affinity_bits(&self) -> [u8; 3] {
        [
            self.affinity & 1,
            (self.affinity >> 1) & 1,
            (self.affinity >> 2) & 1,
        ]
    }
}

/// Raw table row as stored by the scheduler.
///
/// The name is a guest pointer (0 when unset), resolved lazily with
/// [`ThreadRecord::resolve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadRecord {
    pub handle: u32,
    pub entrypoint: u32,
    pub ip: u32,
    pub lr: u32,
    pub state: u8,
    pub suspend_counter: i32,
    pub affinity: u8,
    pub priority: i32,
    pub name_ptr: u32,
}

impl ThreadRecord {
    /// A READY thread on all cores, starting at its entrypoint.
    #[must_use]
    pub const fn new(handle: u32, entrypoint: u32) -> Self {
        Self {
            handle,
            entrypoint,
            ip: entrypoint,
            lr: 0,
            state: ThreadState::Ready as u8,
            suspend_counter: 0,
            affinity: 0b111,
            priority: 16,
            name_ptr: 0,
        }
    }

    #[must_use]
    pub const fn with_name_ptr(mut self, name_ptr: u32) -> Self {
        self.name_ptr = name_ptr;
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_affinity(mut self, affinity: u8) -> Self {
        self.affinity = affinity;
        self
    }

    /// Resolve the name pointer through guest memory.
    ///
    /// An unset pointer or an unreadable name gives `name: None`.
    #[must_use]
    pub fn resolve(&self, memory: &dyn GuestMemory) -> GuestThreadEntry {
        let name = if self.name_ptr == 0 {
            None
        } else {
            memory.read_cstr(self.name_ptr, MAX_THREAD_NAME)
        };
        GuestThreadEntry {
            handle: self.handle,
            entrypoint: self.entrypoint,
            ip: self.ip,
            lr: self.lr,
            state: self.state,
            suspend_counter: self.suspend_counter,
            affinity: self.affinity,
            priority: self.priority,
            name,
        }
    }
}

/// Thread table errors.
#[derive(Debug, Error)]
pub enum ThreadTableError {
    #[error("thread table is full ({0} slots)")]
    Full(usize),

    #[error("thread {0:#010x} is already registered")]
    DuplicateHandle(u32),

    #[error("thread {0:#010x} is not registered")]
    UnknownHandle(u32),
}

#[derive(Default)]
struct ThreadSlot {
    handle: AtomicU32,
    entrypoint: AtomicU32,
    ip: AtomicU32,
    lr: AtomicU32,
    state: AtomicU8,
    suspend_counter: AtomicI32,
    affinity: AtomicU8,
    priority: AtomicI32,
    name_ptr: AtomicU32,
}

impl ThreadSlot {
    fn load(&self) -> ThreadRecord {
        ThreadRecord {
            handle: self.handle.load(Ordering::Relaxed),
            entrypoint: self.entrypoint.load(Ordering::Relaxed),
            ip: self.ip.load(Ordering::Relaxed),
            lr: self.lr.load(Ordering::Relaxed),
            state: self.state.load(Ordering::Relaxed),
            suspend_counter: self.suspend_counter.load(Ordering::Relaxed),
            affinity: self.affinity.load(Ordering::Relaxed),
            priority: self.priority.load(Ordering::Relaxed),
            name_ptr: self.name_ptr.load(Ordering::Relaxed),
        }
    }

    fn store(&self, record: &ThreadRecord) {
        self.handle.store(record.handle, Ordering::Relaxed);
        self.entrypoint.store(record.entrypoint, Ordering::Relaxed);
        self.ip.store(record.ip, Ordering::Relaxed);
        self.lr.store(record.lr, Ordering::Relaxed);
        self.state.store(record.state, Ordering::Relaxed);
        self.suspend_counter
            .store(record.suspend_counter, Ordering::Relaxed);
        self.affinity.store(record.affinity, Ordering::Relaxed);
        self.priority.store(record.priority, Ordering::Relaxed);
        self.name_ptr.store(record.name_ptr, Ordering::Relaxed);
    }
}

/// Fixed-capacity table of active guest threads.
pub struct ThreadTable {
    slots: Box<[ThreadSlot]>,
    count: AtomicUsize,
    lock: SlimRwLock,
}

impl ThreadTable {
    /// Create a table with [`MAX_THREADS`] slots.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(MAX_THREADS)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| ThreadSlot::default()).collect(),
            count: AtomicUsize::new(0),
            lock: SlimRwLock::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of registered threads.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire).min(self.slots.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a thread. Returns its slot index.
    ///
    /// # Errors
    ///
    /// Fails if the handle is already present or the table is full.
    pub fn register(&self, record: ThreadRecord) -> Result<usize, ThreadTableError> {
        let _guard = self.lock.write();
        let count = self.len();
        if self.find(record.handle, count).is_some() {
            return Err(ThreadTableError::DuplicateHandle(record.handle));
        }
        let slot = self
            .slots
            .get(count)
            .ok_or(ThreadTableError::Full(self.slots.len()))?;
        slot.store(&record);
        self.count.store(count + 1, Ordering::Release);
        Ok(count)
    }

    /// Remove a thread, moving the last row into its slot.
    ///
    /// # Errors
    ///
    /// Fails if the handle is not registered.
    pub fn remove(&self, handle: u32) -> Result<ThreadRecord, ThreadTableError> {
        let _guard = self.lock.write();
        let count = self.len();
        let index = self
            .find(handle, count)
            .ok_or(ThreadTableError::UnknownHandle(handle))?;
        let removed = self.slots[index].load();
        let last = count - 1;
        // Shrink first so lock-free readers never see the duplicated tail.
        self.count.store(last, Ordering::Release);
        if index != last {
            let moved = self.slots[last].load();
            self.slots[index].store(&moved);
        }
        Ok(removed)
    }

    /// Modify a registered thread in place.
    ///
    /// # Errors
    ///
    /// Fails if the handle is not registered.
    pub fn update(
        &self,
        handle: u32,
        f: impl FnOnce(&mut ThreadRecord),
    ) -> Result<(), ThreadTableError> {
        let _guard = self.lock.write();
        let index = self
            .find(handle, self.len())
            .ok_or(ThreadTableError::UnknownHandle(handle))?;
        let mut record = self.slots[index].load();
        f(&mut record);
        // The handle identifies the slot and cannot be rewritten.
        record.handle = handle;
        self.slots[index].store(&record);
        Ok(())
    }

    /// Consistent copy of every row, taken under the shared lock.
    pub fn records(&self) -> Vec<ThreadRecord> {
        let _guard = self.lock.read();
        self.slots[..self.len()]
            .iter()
            .map(ThreadSlot::load)
            .collect()
    }

    /// Read row `index` without locking.
    ///
    /// Returns `None` once `index` is past the live count, which can change
    /// between calls. Safe to call from a fault handler.
    pub fn record_unsynchronized(&self, index: usize) -> Option<ThreadRecord> {
        if index >= self.len() {
            return None;
        }
        self.slots.get(index).map(ThreadSlot::load)
    }

    fn find(&self, handle: u32, count: usize) -> Option<usize> {
        self.slots[..count]
            .iter()
            .position(|slot| slot.handle.load(Ordering::Relaxed) == handle)
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GuestAddressSpace;

    fn entry(state: u8, suspend_counter: i32) -> GuestThreadEntry {
        GuestThreadEntry {
            handle: 0x1000_0100,
            entrypoint: 0x0200_0000,
            ip: 0x0200_0010,
            lr: 0,
            state,
            suspend_counter,
            affinity: 0b101,
            priority: 16,
            name: None,
        }
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(entry(0, 0).display_state(), "NONE");
        assert_eq!(entry(1, 0).display_state(), "READY");
        assert_eq!(entry(2, 0).display_state(), "RUNNING");
        assert_eq!(entry(4, 0).display_state(), "WAITING");
        assert_eq!(entry(8, 0).display_state(), "MORIBUND");
    }

    #[test]
    fn test_suspended_overrides_state() {
        assert_eq!(entry(ThreadState::Running as u8, 2).display_state(), "SUSPENDED");
        assert_eq!(entry(0x7F, -1).display_state(), "SUSPENDED");
    }

    #[test]
    fn test_unmapped_state_is_undefined() {
        assert_eq!(entry(3, 0).display_state(), "UNDEFINED");
        assert_eq!(entry(0xFF, 0).display_state(), "UNDEFINED");
    }

    #[test]
    fn test_affinity_bits() {
        assert_eq!(entry(1, 0).affinity_bits(), [1, 0, 1]);
    }

    #[test]
    fn test_register_update_remove() {
        let table = ThreadTable::with_capacity(4);
        assert!(table.is_empty());

        table.register(ThreadRecord::new(0xA0, 0x100)).expect("fits");
        table.register(ThreadRecord::new(0xB0, 0x200)).expect("fits");
        table.register(ThreadRecord::new(0xC0, 0x300)).expect("fits");
        assert_eq!(table.len(), 3);

        table
            .update(0xB0, |r| {
                r.state = ThreadState::Waiting as u8;
                r.handle = 0xFFFF;
            })
            .expect("registered");
        let row = table.record_unsynchronized(1).expect("in range");
        assert_eq!(row.handle, 0xB0);
        assert_eq!(row.state, ThreadState::Waiting as u8);

        let removed = table.remove(0xA0).expect("registered");
        assert_eq!(removed.entrypoint, 0x100);
        let handles: Vec<u32> = table.records().iter().map(|r| r.handle).collect();
        assert_eq!(handles, vec![0xC0, 0xB0]);
        assert!(table.record_unsynchronized(2).is_none());
    }

    #[test]
    fn test_register_errors() {
        let table = ThreadTable::with_capacity(1);
        table.register(ThreadRecord::new(0xA0, 0x100)).expect("fits");
        assert!(matches!(
            table.register(ThreadRecord::new(0xA0, 0x100)),
            Err(ThreadTableError::DuplicateHandle(0xA0))
        ));
        assert!(matches!(
            table.register(ThreadRecord::new(0xB0, 0x100)),
            Err(ThreadTableError::Full(1))
        ));
        assert!(matches!(
            table.remove(0xB0),
            Err(ThreadTableError::UnknownHandle(0xB0))
        ));
    }

    #[test]
    fn test_resolve_name() {
        let mut mem = GuestAddressSpace::new(0x1000_0000, 4096).expect("allocation should succeed");
        mem.write_bytes(0x1000_0200, b"AudioThread\0").expect("in bounds");

        let named = ThreadRecord::new(0xA0, 0x100).with_name_ptr(0x1000_0200);
        assert_eq!(named.resolve(&mem).name.as_deref(), Some("AudioThread"));

        let unnamed = ThreadRecord::new(0xA0, 0x100);
        assert_eq!(unnamed.resolve(&mem).name, None);

        let dangling = ThreadRecord::new(0xA0, 0x100).with_name_ptr(0x20);
        assert_eq!(dangling.resolve(&mem).name, None);
    }
}
