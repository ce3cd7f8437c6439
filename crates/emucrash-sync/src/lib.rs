//! Reader/writer lock used to guard shared emulator state.
//!
//! `SlimRwLock` exposes explicit acquire/release pairs rather than only
//! guard objects, so code ported from lock/unlock call sites keeps its shape.
//! Any number of shared holders may coexist; an exclusive holder excludes
//! everyone else. Blocking only: there is no timeout and no cancellation.
//!
//! The lock is a thin wrapper over `parking_lot`'s raw rwlock, which is one
//! word wide and never allocates.
//!
//! ```ignore
//! use emucrash_sync::SlimRwLock;
//!
//! let lock = SlimRwLock::new();
//! {
//!     let _shared = lock.read();
//!     // readers run concurrently here
//! }
//! let _exclusive = lock.write();
//! ```

use parking_lot::lock_api::RawRwLock as _;

/// Shared/exclusive lock without reentrancy guarantees.
pub struct SlimRwLock {
    raw: parking_lot::RawRwLock,
}

impl SlimRwLock {
    /// Create an unlocked lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            raw: <parking_lot::RawRwLock as parking_lot::lock_api::RawRwLock>::INIT,
        }
    }

    /// Block until a shared hold is granted.
    pub fn acquire_shared(&self) {
        self.raw.lock_shared();
    }

    /// Release a shared hold.
    ///
    /// # Safety
    ///
    /// The calling thread must hold a shared hold obtained from
    /// [`acquire_shared`](Self::acquire_shared) that has not been released.
    pub unsafe fn release_shared(&self) {
        unsafe { self.raw.unlock_shared() };
    }

    /// Block until the exclusive hold is granted.
    pub fn acquire_exclusive(&self) {
        self.raw.lock_exclusive();
    }

    /// Release the exclusive hold.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the exclusive hold obtained from
    /// [`acquire_exclusive`](Self::acquire_exclusive).
    pub unsafe fn release_exclusive(&self) {
        unsafe { self.raw.unlock_exclusive() };
    }

    /// Acquire a shared hold released when the guard drops.
    pub fn read(&self) -> SharedGuard<'_> {
        self.acquire_shared();
        SharedGuard { lock: self }
    }

    /// Acquire the exclusive hold released when the guard drops.
    pub fn write(&self) -> ExclusiveGuard<'_> {
        self.acquire_exclusive();
        ExclusiveGuard { lock: self }
    }

    /// Whether any shared or exclusive hold is currently granted.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl Default for SlimRwLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared hold on a [`SlimRwLock`].
pub struct SharedGuard<'a> {
    lock: &'a SlimRwLock,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard was created by `read`, which acquired the hold.
        unsafe { self.lock.release_shared() };
    }
}

/// Exclusive hold on a [`SlimRwLock`].
pub struct ExclusiveGuard<'a> {
    lock: &'a SlimRwLock,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard was created by `write`, which acquired the hold.
        unsafe { self.lock.release_exclusive() };
    }
}
