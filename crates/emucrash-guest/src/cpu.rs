//! Register file of the guest CPU instance that is currently executing.
//!
//! The interpreter publishes its registers here as it runs; the crash handler
//! takes a [`GuestCpuSnapshot`] without locking. Fields are independent
//! atomics, so a snapshot taken while the interpreter is running may mix
//! values from neighbouring instructions.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Number of general-purpose registers.
pub const NUM_GPRS: usize = 32;

/// GPR holding the guest stack pointer.
pub const STACK_POINTER_GPR: usize = 1;

/// Point-in-time copy of the active guest CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestCpuSnapshot {
    /// Instruction pointer.
    pub ip: u32,
    /// Link register.
    pub lr: u32,
    /// General-purpose registers.
    pub gpr: [u32; NUM_GPRS],
    /// Guest address of the thread currently scheduled on this CPU.
    pub thread: u32,
}

impl GuestCpuSnapshot {
    /// Guest stack pointer (`r1`).
    #[must_use]
    pub const fn stack_pointer(&self) -> u32 {
        self.gpr[STACK_POINTER_GPR]
    }
}

/// Live register file of the current guest CPU instance.
pub struct ActiveCpu {
    active: AtomicBool,
    ip: AtomicU32,
    lr: AtomicU32,
    thread: AtomicU32,
    gpr: [AtomicU32; NUM_GPRS],
}

impl ActiveCpu {
    /// Create an inactive CPU with zeroed registers.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            ip: AtomicU32::new(0),
            lr: AtomicU32::new(0),
            thread: AtomicU32::new(0),
            gpr: [const { AtomicU32::new(0) }; NUM_GPRS],
        }
    }

    /// Mark the CPU as executing guest code on behalf of `thread`.
    pub fn activate(&self, thread: u32) {
        self.thread.store(thread, Ordering::Relaxed);
        self.active.store(true, Ordering::Release);
    }

    /// Mark the CPU as idle; snapshots return `None` afterwards.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Whether guest code is executing.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_ip(&self, ip: u32) {
        self.ip.store(ip, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_lr(&self, lr: u32) {
        self.lr.store(lr, Ordering::Relaxed);
    }

    /// Set GPR `index`. Out-of-range indices are ignored.
    #[inline]
    pub fn set_gpr(&self, index: usize, value: u32) {
        if let Some(reg) = self.gpr.get(index) {
            reg.store(value, Ordering::Relaxed);
        }
    }

    /// Publish a whole register file at once.
    pub fn publish(&self, snapshot: &GuestCpuSnapshot) {
        self.set_ip(snapshot.ip);
        self.set_lr(snapshot.lr);
        for (reg, value) in self.gpr.iter().zip(snapshot.gpr) {
            reg.store(value, Ordering::Relaxed);
        }
        self.thread.store(snapshot.thread, Ordering::Relaxed);
    }

    /// Copy the registers, or `None` if no guest code is executing.
    pub fn snapshot(&self) -> Option<GuestCpuSnapshot> {
        if !self.is_active() {
            return None;
        }
        let mut gpr = [0u32; NUM_GPRS];
        for (value, reg) in gpr.iter_mut().zip(&self.gpr) {
            *value = reg.load(Ordering::Relaxed);
        }
        Some(GuestCpuSnapshot {
            ip: self.ip.load(Ordering::Relaxed),
            lr: self.lr.load(Ordering::Relaxed),
            gpr,
            thread: self.thread.load(Ordering::Relaxed),
        })
    }
}

impl Default for ActiveCpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_has_no_snapshot() {
        let cpu = ActiveCpu::new();
        cpu.set_ip(0x0200_0000);
        assert!(cpu.snapshot().is_none());
    }

    #[test]
    fn test_snapshot_after_activate() {
        let cpu = ActiveCpu::new();
        cpu.set_ip(0x0200_0010);
        cpu.set_lr(0x0200_0004);
        cpu.set_gpr(1, 0x1000_8000);
        cpu.set_gpr(31, 0xABCD);
        cpu.set_gpr(32, 0xFFFF); // ignored
        cpu.activate(0x1000_0100);

        let snap = cpu.snapshot().expect("cpu is active");
        assert_eq!(snap.ip, 0x0200_0010);
        assert_eq!(snap.lr, 0x0200_0004);
        assert_eq!(snap.stack_pointer(), 0x1000_8000);
        assert_eq!(snap.gpr[31], 0xABCD);
        assert_eq!(snap.thread, 0x1000_0100);

        cpu.deactivate();
        assert!(cpu.snapshot().is_none());
    }

    #[test]
    fn test_publish_round_trip() {
        let cpu = ActiveCpu::new();
        let mut gpr = [0u32; NUM_GPRS];
        for (i, reg) in gpr.iter_mut().enumerate() {
            *reg = i as u32 * 0x11;
        }
        let snap = GuestCpuSnapshot {
            ip: 1,
            lr: 2,
            gpr,
            thread: 3,
        };
        cpu.publish(&snap);
        cpu.activate(3);
        assert_eq!(cpu.snapshot(), Some(snap));
    }
}
