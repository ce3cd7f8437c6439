//! Linux snapshot backend reading the crashed process through procfs.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! header:  magic[8] version:u32 level:u8 pad[3] code:u32 address:u64
//!          timestamp:i64 thread_id:u64 ip:u64 gpr:[u64; 16]
//! stream:  kind:u32 len:u64 payload[len]       (repeated until EOF)
//! ```
//!
//! `Memory` payloads start with the region's start address as a `u64`.

use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;

use crate::event::{CrashEvent, HostRegisters};

use super::{SnapshotBackend, SnapshotLevel, SnapshotRequest};

pub const SNAPSHOT_MAGIC: [u8; 8] = *b"EMUCRSH\0";
pub const SNAPSHOT_VERSION: u32 = 1;

/// Bytes captured on each side of a register value that points into memory.
const REGISTER_WINDOW: u64 = 1024;
/// Bytes captured above the stack pointer.
const STACK_SCAN: u64 = 16 * 1024;
/// Per-region cap for full snapshots.
const FULL_REGION_CAP: u64 = 64 << 20;

/// Typed stream following the header.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    MemoryMap = 1,
    Memory = 2,
    Threads = 3,
    Modules = 4,
}

impl StreamKind {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::MemoryMap),
            2 => Some(Self::Memory),
            3 => Some(Self::Threads),
            4 => Some(Self::Modules),
            _ => None,
        }
    }
}

/// One line of `/proc/<pid>/maps`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub private: bool,
    pub offset: u64,
    pub path: Option<String>,
}

/// Split off the next whitespace-delimited field.
fn next_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    Some(s.split_once(char::is_whitespace).unwrap_or((s, "")))
}

impl MapEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let (range, rest) = next_field(line)?;
        let (perms, rest) = next_field(rest)?;
        let (offset, rest) = next_field(rest)?;
        let (_dev, rest) = next_field(rest)?;
        let (_inode, rest) = next_field(rest)?;

        let (start, end) = range.split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        if end < start {
            return None;
        }
        let perms = perms.as_bytes();
        if perms.len() < 4 {
            return None;
        }
        let path = rest.trim();

        Some(Self {
            start,
            end,
            readable: perms[0] == b'r',
            writable: perms[1] == b'w',
            private: perms[3] == b'p',
            offset: u64::from_str_radix(offset, 16).ok()?,
            path: (!path.is_empty()).then(|| path.to_string()),
        })
    }

    pub const fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    /// File-backed, as opposed to anonymous or a `[pseudo]` mapping.
    pub fn is_file_backed(&self) -> bool {
        self.path.as_deref().is_some_and(|p| p.starts_with('/'))
    }
}

/// Sort and coalesce overlapping or touching `[start, end)` ranges.
pub fn merge_ranges(mut ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    ranges.retain(|&(start, end)| start < end);
    ranges.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

fn readable_entry(entries: &[MapEntry], addr: u64) -> Option<&MapEntry> {
    entries.iter().find(|e| e.readable && e.contains(addr))
}

/// Windows around register values plus the top of the stack.
pub fn partial_regions(entries: &[MapEntry], registers: &HostRegisters) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    for value in registers.gpr.iter().copied().chain([registers.ip]) {
        if let Some(entry) = readable_entry(entries, value) {
            let start = value.saturating_sub(REGISTER_WINDOW).max(entry.start);
            let end = value.saturating_add(REGISTER_WINDOW).min(entry.end);
            ranges.push((start, end));
        }
    }
    let sp = registers.stack_pointer();
    if let Some(entry) = readable_entry(entries, sp) {
        ranges.push((sp, sp.saturating_add(STACK_SCAN).min(entry.end)));
    }
    merge_ranges(ranges)
}

/// Every private writable mapping, each capped.
pub fn full_regions(entries: &[MapEntry]) -> Vec<(u64, u64)> {
    let ranges = entries
        .iter()
        .filter(|e| e.readable && e.writable && e.private)
        .map(|e| (e.start, e.end.min(e.start.saturating_add(FULL_REGION_CAP))))
        .collect();
    merge_ranges(ranges)
}

/// First mapping of every file-backed object, as `base path` lines.
fn module_list(entries: &[MapEntry]) -> String {
    let mut seen: Vec<&str> = Vec::new();
    let mut out = String::new();
    for entry in entries.iter().filter(|e| e.is_file_backed()) {
        let Some(path) = entry.path.as_deref() else {
            continue;
        };
        if seen.contains(&path) {
            continue;
        }
        seen.push(path);
        let base = entry.start.saturating_sub(entry.offset);
        out.push_str(&format!("{base:016x} {path}\n"));
    }
    out
}

/// `tid stat` lines for every task of this process.
fn thread_list() -> io::Result<String> {
    let mut tids: Vec<u64> = fs::read_dir("/proc/self/task")?
        .filter_map(|e| e.ok()?.file_name().to_str()?.parse().ok())
        .collect();
    tids.sort_unstable();
    let mut out = String::new();
    for tid in tids {
        let stat = fs::read_to_string(format!("/proc/self/task/{tid}/stat")).unwrap_or_default();
        out.push_str(&format!("{tid} {}\n", stat.trim_end()));
    }
    Ok(out)
}

fn write_header(out: &mut dyn Write, level: SnapshotLevel, event: &CrashEvent) -> io::Result<()> {
    out.write_all(&SNAPSHOT_MAGIC)?;
    out.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
    out.write_all(&[level.as_u8(), 0, 0, 0])?;
    out.write_all(&event.code.to_le_bytes())?;
    out.write_all(&event.address.to_le_bytes())?;
    out.write_all(&event.timestamp.timestamp().to_le_bytes())?;
    out.write_all(&event.thread_id.to_le_bytes())?;
    out.write_all(&event.registers.ip.to_le_bytes())?;
    for value in event.registers.gpr {
        out.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn write_stream(out: &mut dyn Write, kind: StreamKind, parts: &[&[u8]]) -> io::Result<()> {
    let len: usize = parts.iter().map(|p| p.len()).sum();
    out.write_all(&(kind as u32).to_le_bytes())?;
    out.write_all(&(len as u64).to_le_bytes())?;
    for part in parts {
        out.write_all(part)?;
    }
    Ok(())
}

/// Snapshot built from `/proc/self`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcfsSnapshot;

impl ProcfsSnapshot {
    pub const fn new() -> Self {
        Self
    }
}

impl SnapshotBackend for ProcfsSnapshot {
    fn write_snapshot(&self, out: &mut dyn Write, request: &SnapshotRequest<'_>) -> io::Result<()> {
        let maps = fs::read_to_string("/proc/self/maps")?;
        let entries: Vec<MapEntry> = maps.lines().filter_map(MapEntry::parse).collect();

        write_header(out, request.level, request.event)?;
        write_stream(out, StreamKind::MemoryMap, &[maps.as_bytes()])?;

        let regions = match request.level {
            SnapshotLevel::Disabled => Vec::new(),
            SnapshotLevel::Partial => partial_regions(&entries, &request.event.registers),
            SnapshotLevel::Full => full_regions(&entries),
        };
        // Without /proc/self/mem the map alone is still worth keeping.
        if let Ok(mem) = File::open("/proc/self/mem") {
            let mut buf = Vec::new();
            for (start, end) in regions {
                let Ok(len) = usize::try_from(end - start) else {
                    continue;
                };
                buf.resize(len, 0);
                if mem.read_exact_at(&mut buf, start).is_err() {
                    continue;
                }
                write_stream(out, StreamKind::Memory, &[&start.to_le_bytes(), &buf])?;
            }
        }

        if request.level == SnapshotLevel::Full {
            let threads = thread_list().unwrap_or_default();
            write_stream(out, StreamKind::Threads, &[threads.as_bytes()])?;
            let modules = module_list(&entries);
            write_stream(out, StreamKind::Modules, &[modules.as_bytes()])?;
        }
        Ok(())
    }
}
