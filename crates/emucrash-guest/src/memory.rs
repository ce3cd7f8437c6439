//! Guest address space backed by a guarded host mapping.
//!
//! The guest sees a window `[base, base + size)` of its 32-bit address space.
//! The host backs it with `[GUARD][MEMORY][GUARD]`, the guard pages mapped
//! `PROT_NONE` so a stray host access just outside the window faults at the
//! OS level instead of touching unrelated memory.
//!
//! Reads through [`GuestMemory`] are bounds-checked against the window and
//! return `None` instead of faulting, which is what a crash handler needs
//! when the guest address space may be corrupted.

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, mprotect, munmap};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use thiserror::Error;

/// Guard page size (16KB, must be >= page size).
pub const GUARD_SIZE: usize = 1 << 14;

/// Size of the full 32-bit guest address space.
const GUEST_SPACE: u64 = 1 << 32;

/// Guest memory allocation and access errors.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("mmap failed: {0}")]
    MmapFailed(#[from] nix::Error),

    #[error("invalid memory size: {0}")]
    InvalidSize(usize),

    #[error("guest range {addr:#010x}+{len:#x} is outside the mapped window")]
    OutOfBounds { addr: u32, len: usize },
}

/// Read access to guest memory that never faults.
///
/// Guest words are big-endian.
pub trait GuestMemory: Send + Sync {
    /// Whether every byte of `[addr, addr + len)` can be read.
    ///
    /// Ranges that wrap past the end of the 32-bit space are inaccessible.
    fn is_range_accessible(&self, addr: u32, len: u32) -> bool;

    /// Read one byte, or `None` if it is not accessible.
    fn read_u8(&self, addr: u32) -> Option<u8>;

    /// Read one big-endian word, or `None` if it is not accessible.
    fn read_u32(&self, addr: u32) -> Option<u32>;

    /// Read a NUL-terminated string of at most `max_len` bytes.
    ///
    /// Returns `None` when the first byte is inaccessible. A string that runs
    /// into inaccessible memory or hits `max_len` is truncated there.
    fn read_cstr(&self, addr: u32, max_len: usize) -> Option<String> {
        let mut bytes = Vec::new();
        let mut cursor = addr;
        for index in 0..max_len {
            let Some(byte) = self.read_u8(cursor) else {
                if index == 0 {
                    return None;
                }
                break;
            };
            if byte == 0 {
                break;
            }
            bytes.push(byte);
            cursor = cursor.checked_add(1)?;
        }
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Guest address window with guard pages on both sides.
pub struct GuestAddressSpace {
    /// Pointer to the start of the entire region (including first guard).
    region: NonNull<c_void>,
    /// Total size including both guard pages.
    total_size: usize,
    /// Size of the guest-visible window.
    memory_size: usize,
    /// Guest address of the first byte of the window.
    base: u32,
}

impl GuestAddressSpace {
    /// Map a guest window of `memory_size` bytes starting at guest `base`.
    ///
    /// # Errors
    ///
    /// Returns an error if the window is empty, extends past the 32-bit
    /// guest space, or mmap fails.
    pub fn new(base: u32, memory_size: usize) -> Result<Self, MemoryError> {
        if memory_size == 0 || u64::from(base) + memory_size as u64 > GUEST_SPACE {
            return Err(MemoryError::InvalidSize(memory_size));
        }

        let total_size = memory_size
            .checked_add(2 * GUARD_SIZE)
            .ok_or(MemoryError::InvalidSize(memory_size))?;
        let total_size_nz =
            NonZeroUsize::new(total_size).ok_or(MemoryError::InvalidSize(memory_size))?;

        // Reserve everything as PROT_NONE, then open up the middle.
        let region = unsafe {
            mmap_anonymous(
                None,
                total_size_nz,
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE,
            )?
        };

        let window = unsafe {
            NonNull::new_unchecked(
                region
                    .as_ptr()
                    .cast::<u8>()
                    .add(GUARD_SIZE)
                    .cast::<c_void>(),
            )
        };
        if let Err(e) =
            unsafe { mprotect(window, memory_size, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE) }
        {
            unsafe {
                let _ = munmap(region, total_size);
            }
            return Err(e.into());
        }

        Ok(Self {
            region,
            total_size,
            memory_size,
            base,
        })
    }

    /// Guest address of the first mapped byte.
    #[must_use]
    pub const fn base(&self) -> u32 {
        self.base
    }

    /// Size of the guest-visible window.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.memory_size
    }

    /// Returns pointer to the window (after the first guard page).
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().cast::<u8>().add(GUARD_SIZE) }
    }

    /// Host offset of `[addr, addr + len)` inside the window.
    fn offset_of(&self, addr: u32, len: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)? as usize;
        let end = offset.checked_add(len)?;
        (end <= self.memory_size).then_some(offset)
    }

    /// Zero the entire window.
    pub fn clear(&mut self) {
        unsafe {
            std::ptr::write_bytes(self.as_ptr(), 0, self.memory_size);
        }
    }

    /// Copy `data` into guest memory at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfBounds`] if the range leaves the window.
    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let offset = self
            .offset_of(addr, data.len())
            .ok_or(MemoryError::OutOfBounds {
                addr,
                len: data.len(),
            })?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Store a big-endian word at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfBounds`] if the word leaves the window.
    pub fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write_bytes(addr, &value.to_be_bytes())
    }
}

impl GuestMemory for GuestAddressSpace {
    fn is_range_accessible(&self, addr: u32, len: u32) -> bool {
        self.offset_of(addr, len as usize).is_some()
    }

    fn read_u8(&self, addr: u32) -> Option<u8> {
        let offset = self.offset_of(addr, 1)?;
        // The emulator may be writing concurrently.
        Some(unsafe { std::ptr::read_volatile(self.as_ptr().add(offset)) })
    }

    fn read_u32(&self, addr: u32) -> Option<u32> {
        let offset = self.offset_of(addr, 4)?;
        let bytes = unsafe { std::ptr::read_volatile(self.as_ptr().add(offset).cast::<[u8; 4]>()) };
        Some(u32::from_be_bytes(bytes))
    }
}

impl Drop for GuestAddressSpace {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.region, self.total_size);
        }
    }
}

// Writes need `&mut self`; shared reads are volatile and bounds-checked.
unsafe impl Send for GuestAddressSpace {}
unsafe impl Sync for GuestAddressSpace {}
