//! Guest sections of the crash log.
//!
//! Everything here reads the guest through [`GuestStateProvider`] and
//! [`GuestMemory`], which never fault. Memory is only read after the range
//! was reported accessible.

use emucrash_guest::{GuestCpuSnapshot, GuestMemory, GuestStateProvider, GuestThreadEntry};

use crate::config::{CrashConfig, DEFAULT_GUEST_BACKCHAIN_DEPTH, DEFAULT_GUEST_STACK_LINES};
use crate::sink::{LogSink, write_section_header};

/// Bytes per stack dump line.
pub const STACK_LINE_BYTES: u32 = 32;

/// Writes guest info, CPU, stack and thread sections.
#[derive(Clone, Copy, Debug)]
pub struct GuestDumper {
    stack_lines: usize,
    backchain_depth: usize,
}

impl Default for GuestDumper {
    fn default() -> Self {
        Self::new(DEFAULT_GUEST_STACK_LINES, DEFAULT_GUEST_BACKCHAIN_DEPTH)
    }
}

impl GuestDumper {
    pub const fn new(stack_lines: usize, backchain_depth: usize) -> Self {
        Self {
            stack_lines,
            backchain_depth,
        }
    }

    pub const fn from_config(config: &CrashConfig) -> Self {
        Self::new(config.guest_stack_lines, config.guest_backchain_depth)
    }

    /// `Guest info`, `Active guest CPU` and, with an active CPU, the guest
    /// stack trace and dump.
    pub fn write_info(&self, sink: &dyn LogSink, guest: Option<&dyn GuestStateProvider>) {
        sink.write_plain("\n");
        write_section_header(sink, "Guest info");
        match guest.and_then(|g| g.title()) {
            Some(title) => {
                sink.write_line(&format!("Title: {}", title.name), false, false);
                sink.write_line(&format!("TitleId: {:016x}", title.title_id), false, false);
                sink.write_line(&format!("ContentHash: {:08x}", title.content_hash), false, false);
            }
            None => sink.write_line("Not running", false, false),
        }

        sink.write_plain("\n");
        write_section_header(sink, "Active guest CPU");
        let Some((guest, cpu)) = guest.and_then(|g| g.current_cpu().map(|cpu| (g, cpu))) else {
            sink.write_line("Not active", false, false);
            return;
        };
        for line in cpu_lines(&cpu) {
            sink.write_line(&line, false, false);
        }

        let memory = guest.memory();
        sink.write_plain("\n");
        write_section_header(sink, "Guest stack trace");
        for line in backchain_lines(memory, cpu.stack_pointer(), self.backchain_depth) {
            sink.write_line(&line, false, false);
        }

        sink.write_plain("\n");
        write_section_header(sink, "Guest stack dump");
        for line in stack_dump_lines(memory, cpu.stack_pointer(), self.stack_lines) {
            sink.write_line(&line, false, false);
        }
    }

    /// `Guest threads`, one line per table row.
    pub fn write_threads(&self, sink: &dyn LogSink, guest: Option<&dyn GuestStateProvider>) {
        sink.write_plain("\n");
        write_section_header(sink, "Guest threads");
        let mut written = 0;
        if let Some(guest) = guest {
            // Rows removed after `thread_count` come back as None.
            for entry in (0..guest.thread_count()).filter_map(|i| guest.thread(i)) {
                sink.write_line(&thread_line(&entry), false, false);
                written += 1;
            }
        }
        if written == 0 {
            sink.write_line("None active", false, false);
        }
    }
}

/// Header line, a blank line, then GPRs eight per line.
pub fn cpu_lines(cpu: &GuestCpuSnapshot) -> Vec<String> {
    let mut lines = vec![
        format!(
            "IP 0x{:08x} LR 0x{:08x} Thread 0x{:08x}",
            cpu.ip, cpu.lr, cpu.thread
        ),
        String::new(),
    ];
    lines.extend(cpu.gpr.chunks(8).enumerate().map(|(row, values)| {
        values
            .iter()
            .enumerate()
            .map(|(col, value)| format!("r{:<2}={value:08x}", row * 8 + col))
            .collect::<Vec<_>>()
            .join(" ")
    }));
    lines
}

/// Follow the back chain from `sp`: `[sp]` links to the caller frame and
/// `[sp + 4]` holds the saved link register.
///
/// Stops at an unreadable frame, a null link or a link that does not move up
/// the stack.
pub fn backchain_lines(memory: &dyn GuestMemory, sp: u32, depth: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut sp = sp;
    for _ in 0..depth {
        let frame = memory
            .is_range_accessible(sp, 8)
            .then(|| Some((memory.read_u32(sp)?, memory.read_u32(sp.wrapping_add(4))?)))
            .flatten();
        let Some((next, lr)) = frame else {
            lines.push(format!("SP 0x{sp:08x} ?"));
            break;
        };
        lines.push(format!("SP 0x{sp:08x} LR 0x{lr:08x}"));
        if next == 0 || next <= sp {
            break;
        }
        sp = next;
    }
    lines
}

/// `lines` rows of 32 bytes starting at `sp`.
pub fn stack_dump_lines(memory: &dyn GuestMemory, sp: u32, lines: usize) -> Vec<String> {
    let mut out = Vec::with_capacity(lines);
    let mut addr = sp;
    for _ in 0..lines {
        if memory.is_range_accessible(addr, STACK_LINE_BYTES) {
            let words: Vec<String> = (0..8u32)
                .map(|w| {
                    memory
                        .read_u32(addr.wrapping_add(w * 4))
                        .map_or_else(|| "????????".to_string(), |v| format!("{v:08x}"))
                })
                .collect();
            out.push(format!(
                "[0x{addr:08x}] {} - {}",
                words[..4].join(" "),
                words[4..].join(" ")
            ));
        } else {
            out.push(format!("[0x{addr:08x}] ?"));
        }
        addr = addr.wrapping_add(STACK_LINE_BYTES);
    }
    out
}

pub fn thread_line(entry: &GuestThreadEntry) -> String {
    let [a0, a1, a2] = entry.affinity_bits();
    format!(
        "{:08x} Ent {:08x} IP {:08x} LR {:08x} {:<9} Aff {a0}{a1}{a2} Pri {:2} Name {}",
        entry.handle,
        entry.entrypoint,
        entry.ip,
        entry.lr,
        entry.display_state(),
        entry.priority,
        entry.name.as_deref().unwrap_or("NULL"),
    )
}
