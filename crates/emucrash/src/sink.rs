//! Log sinks receiving the crash text.
//!
//! The host application normally owns its log file; the crash handler only
//! needs to make sure it exists, append to it and flush it. A sink shared with
//! the rest of the process may be locked by the thread that faulted, so
//! [`FileLogSink`] waits on its mutex once, for a bounded time, and after a
//! timeout sends everything to stderr.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{error, info, warn};

/// How long a writer waits for the file mutex before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_millis(250);

/// Horizontal rule around section headers.
const SECTION_RULE: &str = "-----------------------------------------\n";

/// Destination of the crash log text.
pub trait LogSink: Send + Sync {
    /// Create the backing log if needed, truncating it when `truncate` is set.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the log cannot be created.
    fn ensure_created(&self, truncate: bool) -> io::Result<()>;

    /// Write `text` and a newline, optionally echoing it to the console.
    fn write_line(&self, text: &str, also_console: bool, is_error: bool);

    /// Write `text` verbatim.
    fn write_plain(&self, text: &str);

    /// Push buffered text to durable storage.
    fn flush(&self);

    /// Backing file, if any.
    fn path(&self) -> Option<&Path>;
}

/// Write a boxed section header.
pub fn write_section_header(sink: &dyn LogSink, title: &str) {
    sink.write_plain(SECTION_RULE);
    sink.write_plain("   ");
    sink.write_plain(title);
    sink.write_plain("\n");
    sink.write_plain(SECTION_RULE);
}

fn echo(text: &str, is_error: bool) {
    if is_error {
        error!("{text}");
    } else {
        info!("{text}");
    }
}

type Writer = Option<BufWriter<File>>;

/// Buffered log file.
pub struct FileLogSink {
    path: PathBuf,
    writer: Mutex<Writer>,
    /// Set after the first lock timeout. The mutex is never touched again.
    degraded: AtomicBool,
}

impl FileLogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether text now bypasses the file and goes to stderr.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn lock_writer(&self) -> Option<MutexGuard<'_, Writer>> {
        if self.is_degraded() {
            return None;
        }
        let writer = self.writer.try_lock_for(LOCK_TIMEOUT);
        if writer.is_none() && !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(path = %self.path.display(), "log file is locked, writing to stderr");
        }
        writer
    }
}

impl LogSink for FileLogSink {
    fn ensure_created(&self, truncate: bool) -> io::Result<()> {
        let mut writer = self
            .lock_writer()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "log file is locked"))?;
        if writer.is_some() && !truncate {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(truncate)
            .append(!truncate)
            .open(&self.path)?;
        *writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn write_line(&self, text: &str, also_console: bool, is_error: bool) {
        self.write_plain(text);
        self.write_plain("\n");
        if also_console {
            echo(text, is_error);
        }
    }

    fn write_plain(&self, text: &str) {
        let written = self
            .lock_writer()
            .and_then(|mut writer| writer.as_mut().map(|w| w.write_all(text.as_bytes()).is_ok()));
        if written != Some(true) {
            eprint!("{text}");
        }
    }

    fn flush(&self) {
        if let Some(mut writer) = self.lock_writer() {
            if let Some(w) = writer.as_mut() {
                let _ = w.flush();
                let _ = w.get_ref().sync_all();
            }
        }
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// In-memory sink for tests and previews.
#[derive(Default)]
pub struct MemoryLogSink {
    buffer: Mutex<String>,
    creations: AtomicUsize,
    flushes: AtomicUsize,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    pub fn contents(&self) -> String {
        self.buffer.lock().clone()
    }

    /// Number of `ensure_created` calls.
    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    /// Number of `flush` calls.
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl LogSink for MemoryLogSink {
    fn ensure_created(&self, truncate: bool) -> io::Result<()> {
        if truncate {
            self.buffer.lock().clear();
        }
        self.creations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_line(&self, text: &str, also_console: bool, is_error: bool) {
        {
            let mut buffer = self.buffer.lock();
            buffer.push_str(text);
            buffer.push('\n');
        }
        if also_console {
            echo(text, is_error);
        }
    }

    fn write_plain(&self, text: &str) {
        self.buffer.lock().push_str(text);
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;
    use crate::config::CrashConfig;
    use crate::coordinator::CrashCoordinator;
    use crate::event::{CrashEvent, HostRegisters};
    use crate::native_stack::{NativeStackWalker, NoSymbols};

    #[test]
    fn test_section_header() {
        let sink = MemoryLogSink::new();
        write_section_header(&sink, "Stack trace");
        assert_eq!(
            sink.contents(),
            format!("{SECTION_RULE}   Stack trace\n{SECTION_RULE}")
        );
    }

    #[test]
    fn test_memory_sink_truncates() {
        let sink = MemoryLogSink::new();
        sink.write_line("old", false, false);
        sink.ensure_created(true).expect("memory sink cannot fail");
        sink.write_plain("new");
        assert_eq!(sink.contents(), "new");
        assert_eq!(sink.creations(), 1);
    }

    #[test]
    fn test_file_sink_writes_and_flushes() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("logs").join("log.txt");
        let sink = FileLogSink::new(&path);

        sink.ensure_created(true).expect("create log");
        sink.write_line("first", false, false);
        sink.write_plain("second");
        sink.flush();
        assert_eq!(
            std::fs::read_to_string(&path).expect("read log"),
            "first\nsecond"
        );
        assert_eq!(sink.path(), Some(path.as_path()));
    }

    #[test]
    fn test_file_sink_truncate_and_append() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("log.txt");
        std::fs::write(&path, "previous run\n").expect("seed log");

        let appending = FileLogSink::new(&path);
        appending.ensure_created(false).expect("open log");
        appending.write_line("more", false, false);
        appending.flush();
        assert_eq!(
            std::fs::read_to_string(&path).expect("read log"),
            "previous run\nmore\n"
        );

        let truncating = FileLogSink::new(&path);
        truncating.ensure_created(true).expect("open log");
        truncating.write_line("fresh", false, false);
        truncating.flush();
        assert_eq!(std::fs::read_to_string(&path).expect("read log"), "fresh\n");
    }

    #[test]
    fn test_locked_file_sink_waits_once() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let sink = Arc::new(FileLogSink::new(dir.path().join("log.txt")));
        let coordinator = CrashCoordinator::new(
            CrashConfig::rooted_at(dir.path()),
            Arc::clone(&sink) as Arc<dyn LogSink>,
        )
        .with_stack_walker(NativeStackWalker::with_resolvers(
            8,
            Arc::new(NoSymbols),
            Arc::new(NoSymbols),
        ));

        let _held = sink.writer.lock();
        let started = Instant::now();
        coordinator
            .handle_fault(&CrashEvent::new(11, 0, HostRegisters::default()))
            .expect("handled");
        assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
        assert!(sink.is_degraded());
    }

    #[test]
    fn test_degraded_sink_skips_file() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("log.txt");
        let sink = FileLogSink::new(&path);
        sink.ensure_created(true).expect("create log");
        sink.write_line("before", false, false);
        sink.flush();

        {
            let _held = sink.writer.lock();
            sink.write_plain("lost");
        }
        assert!(sink.is_degraded());
        sink.write_plain("after");
        sink.flush();
        assert_eq!(std::fs::read_to_string(&path).expect("read log"), "before\n");
    }
}
