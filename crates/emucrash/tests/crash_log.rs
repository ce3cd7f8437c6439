//! End-to-end crash sequence tests against fake guests.

use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use chrono::{Duration, TimeZone, Utc};
use emucrash::event::HostRegisters;
use emucrash::guest::{
    GuestCpuSnapshot, GuestMemory, GuestStateProvider, GuestThreadEntry, NUM_GPRS, TitleInfo,
};
use emucrash::native_stack::NoSymbols;
use emucrash::snapshot::{SnapshotRequest, artifact_file_name};
use emucrash::{
    CrashConfig, CrashCoordinator, CrashEvent, FileLogSink, LogSink, MemoryLogSink,
    NativeStackWalker, SnapshotBackend, SnapshotLevel,
};
use regex::Regex;

/// Memory readable in `[start, end)` that counts every read.
struct CountingMemory {
    start: u32,
    end: u32,
    reads: AtomicUsize,
}

impl CountingMemory {
    fn new(start: u32, len: u32) -> Self {
        Self {
            start,
            end: start + len,
            reads: AtomicUsize::new(0),
        }
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl GuestMemory for CountingMemory {
    fn is_range_accessible(&self, addr: u32, len: u32) -> bool {
        addr >= self.start && u64::from(addr) + u64::from(len) <= u64::from(self.end)
    }

    fn read_u8(&self, addr: u32) -> Option<u8> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.is_range_accessible(addr, 1).then_some(0)
    }

    fn read_u32(&self, addr: u32) -> Option<u32> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.is_range_accessible(addr, 4).then_some(addr)
    }
}

struct FakeGuest {
    memory: CountingMemory,
    cpu: Option<GuestCpuSnapshot>,
    threads: Vec<GuestThreadEntry>,
}

impl GuestStateProvider for FakeGuest {
    fn title(&self) -> Option<TitleInfo> {
        Some(TitleInfo {
            name: "Fake Title".into(),
            title_id: 0x0005_000e_1010_2000,
            content_hash: 0x1234_5678,
        })
    }

    fn current_cpu(&self) -> Option<GuestCpuSnapshot> {
        self.cpu
    }

    fn thread_count(&self) -> usize {
        self.threads.len()
    }

    fn thread(&self, index: usize) -> Option<GuestThreadEntry> {
        self.threads.get(index).cloned()
    }

    fn memory(&self) -> &dyn GuestMemory {
        &self.memory
    }
}

/// Backend writing a fixed marker, so the tests do not depend on procfs.
struct MarkerBackend;

impl SnapshotBackend for MarkerBackend {
    fn write_snapshot(&self, out: &mut dyn Write, request: &SnapshotRequest<'_>) -> io::Result<()> {
        writeln!(out, "snapshot code={}", request.event.code)
    }
}

const STACK_BASE: u32 = 0x1000_0000;

fn cpu(sp: u32) -> GuestCpuSnapshot {
    let mut gpr = [0u32; NUM_GPRS];
    gpr[1] = sp;
    GuestCpuSnapshot {
        ip: 0x0200_0040,
        lr: 0x0200_0020,
        gpr,
        thread: 0x1000_8000,
    }
}

fn thread_entry(handle: u32, state: u8, suspend_counter: i32) -> GuestThreadEntry {
    GuestThreadEntry {
        handle,
        entrypoint: 0x0200_0000,
        ip: 0x0200_0040,
        lr: 0x0200_0020,
        state,
        suspend_counter,
        affinity: 0b111,
        priority: 16,
        name: None,
    }
}

fn walker() -> NativeStackWalker {
    NativeStackWalker::with_resolvers(8, Arc::new(NoSymbols), Arc::new(NoSymbols))
}

fn event() -> CrashEvent {
    CrashEvent::new(11, 0x4, HostRegisters::default())
}

fn memory_coordinator(
    config: CrashConfig,
    guest: Option<Arc<FakeGuest>>,
) -> (CrashCoordinator, Arc<MemoryLogSink>) {
    let sink = Arc::new(MemoryLogSink::new());
    let mut coordinator =
        CrashCoordinator::new(config, Arc::clone(&sink) as Arc<dyn LogSink>).with_stack_walker(walker());
    if let Some(guest) = guest {
        coordinator = coordinator.with_guest(guest);
    }
    (coordinator, sink)
}

#[test]
fn test_concurrent_faults_handled_once() {
    const FAULTS: usize = 8;
    let (coordinator, sink) = memory_coordinator(CrashConfig::default(), None);
    let coordinator = Arc::new(coordinator);
    let barrier = Arc::new(Barrier::new(FAULTS));

    let handles: Vec<_> = (0..FAULTS)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                coordinator.handle_fault(&event()).is_some()
            })
        })
        .collect();
    let handled = handles
        .into_iter()
        .map(|h| h.join().expect("fault thread"))
        .filter(|&handled| handled)
        .count();

    assert_eq!(handled, 1);
    assert_eq!(sink.contents().matches("Crashlog for").count(), 1);
    assert_eq!(sink.creations(), 1);
}

#[inline(never)]
fn fault_site(coordinator: &CrashCoordinator) {
    std::hint::black_box(coordinator.handle_fault(&event()).expect("handled"));
}

#[test]
fn test_stack_trace_starts_above_handler() {
    let sink = Arc::new(MemoryLogSink::new());
    let coordinator = CrashCoordinator::new(
        CrashConfig::default(),
        Arc::clone(&sink) as Arc<dyn LogSink>,
    )
    .with_stack_walker(NativeStackWalker::new(4));
    fault_site(&coordinator);

    let text = sink.contents();
    let section = text
        .split_once("   Stack trace\n")
        .expect("stack trace section")
        .1;
    let first = section.lines().nth(1).expect("first frame");
    assert!(first.contains("fault_site"), "{text}");
    assert!(!first.contains("emucrash::"), "{first}");
    assert!(!first.contains("backtrace::"), "{first}");
}

#[test]
fn test_sections_in_fixed_order() {
    let guest = Arc::new(FakeGuest {
        memory: CountingMemory::new(STACK_BASE, 0x1000),
        cpu: Some(cpu(STACK_BASE)),
        threads: vec![thread_entry(0x1000_8000, 2, 0)],
    });
    let (coordinator, sink) = memory_coordinator(CrashConfig::default(), Some(guest));
    coordinator.handle_fault(&event()).expect("handled");
    let text = sink.contents();

    let markers = [
        "Crashlog for",
        "Date: ",
        "   Stack trace\n",
        "Exception 0x0000000b",
        "   Host registers\n",
        "   Guest info\n",
        "Title: Fake Title",
        "   Active guest CPU\n",
        "   Guest stack trace\n",
        "   Guest stack dump\n",
        "   Guest threads\n",
    ];
    let positions: Vec<usize> = markers
        .iter()
        .map(|m| text.find(m).unwrap_or_else(|| panic!("missing {m:?} in:\n{text}")))
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{text}");
}

#[test]
fn test_inactive_cpu_reads_no_guest_memory() {
    let guest = Arc::new(FakeGuest {
        memory: CountingMemory::new(STACK_BASE, 0x1000),
        cpu: None,
        threads: Vec::new(),
    });
    let (coordinator, sink) = memory_coordinator(CrashConfig::default(), Some(Arc::clone(&guest)));
    coordinator.handle_fault(&event()).expect("handled");

    let text = sink.contents();
    assert!(text.contains("   Active guest CPU\n-----------------------------------------\nNot active\n"));
    assert!(!text.contains("Guest stack dump"));
    assert!(text.contains("None active\n"));
    assert_eq!(guest.memory.reads(), 0);
}

#[test]
fn test_no_guest_attached() {
    let (coordinator, sink) = memory_coordinator(CrashConfig::default(), None);
    coordinator.handle_fault(&event()).expect("handled");
    let text = sink.contents();
    assert!(text.contains("Not running\n"));
    assert!(text.contains("Not active\n"));
    assert!(text.contains("None active\n"));
}

#[test]
fn test_inaccessible_stack_lines_are_not_read() {
    // Two readable lines, fourteen unreadable ones.
    let guest = Arc::new(FakeGuest {
        memory: CountingMemory::new(STACK_BASE, 64),
        cpu: Some(cpu(STACK_BASE)),
        threads: Vec::new(),
    });
    let config = CrashConfig {
        guest_backchain_depth: 0,
        ..CrashConfig::default()
    };
    let (coordinator, sink) = memory_coordinator(config, Some(Arc::clone(&guest)));
    coordinator.handle_fault(&event()).expect("handled");

    let text = sink.contents();
    assert!(text.contains("[0x10000000] 10000000 10000004 10000008 1000000c - 10000010"));
    assert!(text.contains("[0x10000040] ?\n"));
    assert!(text.contains("[0x100001e0] ?\n"));
    assert_eq!(text.matches("] ?\n").count(), 14);
    assert_eq!(guest.memory.reads(), 16);
}

#[test]
fn test_thread_states_in_log() {
    let guest = Arc::new(FakeGuest {
        memory: CountingMemory::new(STACK_BASE, 0),
        cpu: None,
        threads: vec![
            thread_entry(0x1000_8000, 4, 0),
            thread_entry(0x1000_8400, 2, 3),
            thread_entry(0x1000_8800, 0x20, 0),
        ],
    });
    let (coordinator, sink) = memory_coordinator(CrashConfig::default(), Some(guest));
    coordinator.handle_fault(&event()).expect("handled");
    let text = sink.contents();
    assert!(text.contains("10008000 Ent 02000000 IP 02000040 LR 02000020 WAITING   Aff 111 Pri 16 Name NULL\n"));
    assert!(text.contains("10008400 Ent 02000000 IP 02000040 LR 02000020 SUSPENDED Aff 111"));
    assert!(text.contains("10008800 Ent 02000000 IP 02000040 LR 02000020 UNDEFINED Aff 111"));
}

#[test]
fn test_disabled_snapshot_creates_nothing() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = CrashConfig::rooted_at(dir.path());
    let sink = Arc::new(FileLogSink::new(config.log_path.clone()));
    let coordinator = CrashCoordinator::new(config.clone(), sink).with_stack_walker(walker());

    let report = coordinator.handle_fault(&event()).expect("handled");
    assert_eq!(report.snapshot, None);
    assert_eq!(report.log_copy, None);
    assert!(!config.dump_dir.exists());
    let log = std::fs::read_to_string(&config.log_path).expect("read log");
    assert!(!log.contains("couldn't write snapshot"));
}

#[test]
fn test_snapshot_and_log_copy() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = CrashConfig::rooted_at(dir.path()).with_snapshot_level(SnapshotLevel::Partial);
    let sink = Arc::new(FileLogSink::new(config.log_path.clone()));
    let coordinator = CrashCoordinator::new(config.clone(), sink)
        .with_stack_walker(walker())
        .with_snapshot_backend(Box::new(MarkerBackend));

    let report = coordinator.handle_fault(&event()).expect("handled");
    let snapshot = report.snapshot.expect("snapshot path");
    let log_copy = report.log_copy.expect("log copy path");

    let name = snapshot.file_name().and_then(|n| n.to_str()).expect("utf-8 name");
    assert!(Regex::new(r"^crash_\d{8}_\d{6}\.dmp$").expect("regex").is_match(name));
    let copy_name = log_copy.file_name().and_then(|n| n.to_str()).expect("utf-8 name");
    assert_eq!(copy_name, name.replace("crash_", "log_").replace(".dmp", ".txt"));
    assert_eq!(snapshot.parent(), Some(config.dump_dir.as_path()));
    assert_eq!(log_copy.parent(), Some(config.dump_dir.as_path()));

    assert_eq!(
        std::fs::read_to_string(&snapshot).expect("read snapshot"),
        "snapshot code=11\n"
    );
    let log = std::fs::read_to_string(&config.log_path).expect("read log");
    assert_eq!(std::fs::read_to_string(&log_copy).expect("read copy"), log);
    assert!(log.contains("Guest threads"));
}

#[test]
fn test_snapshot_failure_is_reported_in_log() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let blocker = dir.path().join("crashdump");
    std::fs::write(&blocker, b"file in the way").expect("create blocker");
    let config = CrashConfig::rooted_at(dir.path()).with_snapshot_level(SnapshotLevel::Full);
    let (coordinator, sink) = memory_coordinator(config, None);

    let report = coordinator.handle_fault(&event()).expect("handled");
    assert_eq!(report.snapshot, None);
    let text = sink.contents();
    assert_eq!(text.matches("couldn't write snapshot: ").count(), 1);
    assert!(text.contains("Guest threads"));
}

#[test]
fn test_artifact_names_one_second_apart() {
    let t0 = Utc
        .with_ymd_and_hms(2025, 12, 31, 23, 59, 59)
        .single()
        .expect("valid timestamp");
    let t1 = t0 + Duration::seconds(1);
    let pattern = Regex::new(r"^crash_\d{8}_\d{6}\.dmp$").expect("regex");

    let a = artifact_file_name("crash", "dmp", t0);
    let b = artifact_file_name("crash", "dmp", t1);
    assert!(pattern.is_match(&a) && pattern.is_match(&b));
    assert_eq!(a, "crash_20251231_235959.dmp");
    assert_eq!(b, "crash_20260101_000000.dmp");
    assert_ne!(a, b);
}
