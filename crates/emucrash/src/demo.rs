//! Demo guest used by the CLI.

use emucrash::CrashError;
use emucrash::guest::{
    GuestAddressSpace, GuestState, ThreadRecord, ThreadState, ThreadTable, TitleInfo,
};

pub const DEMO_BASE: u32 = 0x1000_0000;
pub const DEMO_SIZE: usize = 1 << 20;

const MAIN_THREAD: u32 = 0x1000_8000;
const AUDIO_THREAD: u32 = 0x1000_8400;
const LOADER_THREAD: u32 = 0x1000_8800;
const ENTRYPOINT: u32 = 0x0200_0000;

/// Stack pointer close enough to the end of memory that the last dump lines
/// are inaccessible.
const DEMO_SP: u32 = DEMO_BASE + DEMO_SIZE as u32 - 0x100;

/// A guest with a title, three threads (one suspended) and, if `active_cpu`,
/// a running CPU with a three-frame back chain.
pub fn build(active_cpu: bool) -> Result<GuestState, CrashError> {
    let mut memory = GuestAddressSpace::new(DEMO_BASE, DEMO_SIZE)?;
    memory.write_bytes(DEMO_BASE + 0x100, b"MainThread\0")?;
    memory.write_bytes(DEMO_BASE + 0x140, b"AudioThread\0")?;

    // Back chain: sp -> sp+0x40 -> sp+0x80 -> null.
    for (frame, lr) in [(0u32, 0x0200_1234u32), (0x40, 0x0200_0890), (0x80, 0x0200_0010)] {
        let sp = DEMO_SP + frame;
        let next = if frame == 0x80 { 0 } else { sp + 0x40 };
        memory.write_u32(sp, next)?;
        memory.write_u32(sp + 4, lr)?;
    }

    let threads = ThreadTable::new();
    threads.register(
        ThreadRecord::new(MAIN_THREAD, ENTRYPOINT)
            .with_name_ptr(DEMO_BASE + 0x100)
            .with_priority(16),
    )?;
    threads.register(
        ThreadRecord::new(AUDIO_THREAD, ENTRYPOINT + 0x400)
            .with_name_ptr(DEMO_BASE + 0x140)
            .with_affinity(0b010)
            .with_priority(4),
    )?;
    threads.register(ThreadRecord::new(LOADER_THREAD, ENTRYPOINT + 0x800).with_affinity(0b001))?;
    threads.update(MAIN_THREAD, |record| {
        record.state = ThreadState::Running as u8;
        record.ip = 0x0200_1238;
        record.lr = 0x0200_1234;
    })?;
    threads.update(LOADER_THREAD, |record| record.suspend_counter = 1)?;

    let guest = GuestState::with_threads(memory, threads);
    guest.set_title(Some(TitleInfo {
        name: "Demo Title".into(),
        title_id: 0x0005_0000_1010_1a00,
        content_hash: 0x6e2f_91c4,
    }));

    if active_cpu {
        let cpu = guest.cpu();
        cpu.set_ip(0x0200_1238);
        cpu.set_lr(0x0200_1234);
        for index in 0..32u32 {
            cpu.set_gpr(index as usize, index * 0x11);
        }
        cpu.set_gpr(1, DEMO_SP);
        cpu.activate(MAIN_THREAD);
    }
    Ok(guest)
}
