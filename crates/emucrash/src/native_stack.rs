//! Host call stack capture and symbolization.
//!
//! Capturing only records return addresses. Each address is turned into a
//! [`NativeFrame`] on demand by [`resolve_frame`], so a resolver that dies
//! halfway through still leaves the earlier lines in the log.

use std::ffi::c_void;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use tracing::warn;

use crate::config::DEFAULT_NATIVE_FRAMES;

/// Module containing a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleRef {
    /// Last path component of the module.
    pub name: String,
    /// Address minus module base.
    pub offset: u64,
}

/// One resolved host stack frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeFrame {
    pub address: u64,
    pub module: Option<ModuleRef>,
    pub symbol: Option<String>,
}

impl fmt::Display for NativeFrame {
    /// `0x%016x +0x%08x %-16s symbol`, with `NULL` for an unknown module.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x} ", self.address)?;
        match &self.module {
            Some(module) => write!(f, "+0x{:08x} {:<16}", module.offset, module.name)?,
            None => write!(f, "+0x00000000 {:<16}", "NULL")?,
        }
        write!(f, " {}", self.symbol.as_deref().unwrap_or(""))
    }
}

/// Loaded module covering an address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    pub path: PathBuf,
    pub base: u64,
}

impl ModuleInfo {
    pub fn short_name(&self) -> String {
        self.path
            .file_name()
            .map_or_else(|| self.path.to_string_lossy(), |n| n.to_string_lossy())
            .into_owned()
    }
}

/// Address to symbol name.
pub trait SymbolResolver: Send + Sync {
    fn symbol(&self, address: u64) -> Option<String>;
}

/// Address to owning module.
pub trait ModuleResolver: Send + Sync {
    fn module(&self, address: u64) -> Option<ModuleInfo>;
}

/// Build the frame for one return address.
pub fn resolve_frame(
    address: u64,
    symbols: &dyn SymbolResolver,
    modules: &dyn ModuleResolver,
) -> NativeFrame {
    let module = modules.module(address).map(|info| ModuleRef {
        name: info.short_name(),
        offset: address.wrapping_sub(info.base),
    });
    NativeFrame {
        address,
        module,
        symbol: symbols.symbol(address),
    }
}

/// Resolver that knows nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn symbol(&self, _address: u64) -> Option<String> {
        None
    }
}

impl ModuleResolver for NoSymbols {
    fn module(&self, _address: u64) -> Option<ModuleInfo> {
        None
    }
}

/// Symbols from debug info via `backtrace::resolve`.
///
/// The symbolizer is probed once on first use; if the probe panics, every
/// later lookup returns `None`.
#[derive(Debug, Default)]
pub struct BacktraceSymbols {
    ready: OnceLock<bool>,
}

#[inline(never)]
fn symbolizer_probe() {}

impl BacktraceSymbols {
    pub const fn new() -> Self {
        Self {
            ready: OnceLock::new(),
        }
    }

    fn lookup(address: u64) -> Option<String> {
        let mut name = None;
        backtrace::resolve(address as usize as *mut c_void, |symbol| {
            if name.is_none() {
                name = symbol.name().map(|n| format!("{n:#}"));
            }
        });
        name
    }

    fn is_ready(&self) -> bool {
        *self.ready.get_or_init(|| {
            let probe: fn() = symbolizer_probe;
            let probe = probe as usize as u64;
            let ok = panic::catch_unwind(|| Self::lookup(probe)).is_ok();
            if !ok {
                warn!("symbol resolver failed to initialize, native frames will be unnamed");
            }
            ok
        })
    }
}

impl SymbolResolver for BacktraceSymbols {
    fn symbol(&self, address: u64) -> Option<String> {
        if !self.is_ready() {
            return None;
        }
        panic::catch_unwind(AssertUnwindSafe(|| Self::lookup(address)))
            .ok()
            .flatten()
    }
}

/// Modules from the dynamic loader.
#[cfg(unix)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DladdrModules;

#[cfg(unix)]
impl ModuleResolver for DladdrModules {
    fn module(&self, address: u64) -> Option<ModuleInfo> {
        use std::ffi::CStr;
        use std::os::unix::ffi::OsStrExt;

        let mut info = std::mem::MaybeUninit::<libc::Dl_info>::zeroed();
        // SAFETY: dladdr only inspects loader tables and fills `info`.
        let found = unsafe { libc::dladdr(address as usize as *const c_void, info.as_mut_ptr()) };
        if found == 0 {
            return None;
        }
        // SAFETY: dladdr succeeded, so `info` is initialized.
        let info = unsafe { info.assume_init() };
        if info.dli_fname.is_null() {
            return None;
        }
        // SAFETY: dli_fname is a NUL-terminated string owned by the loader.
        let name = unsafe { CStr::from_ptr(info.dli_fname) };
        Some(ModuleInfo {
            path: PathBuf::from(std::ffi::OsStr::from_bytes(name.to_bytes())),
            base: info.dli_fbase as usize as u64,
        })
    }
}

/// Main executable path and load address.
#[cfg(target_os = "linux")]
pub fn executable_image() -> Option<ModuleInfo> {
    unsafe extern "C" fn first_object(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        // SAFETY: the loader passes a valid info struct; `data` is our u64.
        unsafe {
            let info = &*info;
            let mut lowest = u64::MAX;
            for i in 0..usize::from(info.dlpi_phnum) {
                let phdr = &*info.dlpi_phdr.add(i);
                if phdr.p_type == libc::PT_LOAD {
                    lowest = lowest.min(phdr.p_vaddr as u64);
                }
            }
            let lowest = if lowest == u64::MAX { 0 } else { lowest };
            *data.cast::<u64>() = (info.dlpi_addr as u64).wrapping_add(lowest);
        }
        // The main program is always first.
        1
    }

    let mut base = 0u64;
    // SAFETY: the callback only writes through `data`, which outlives the call.
    unsafe { libc::dl_iterate_phdr(Some(first_object), (&raw mut base).cast()) };
    Some(ModuleInfo {
        path: std::env::current_exe().ok()?,
        base,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn executable_image() -> Option<ModuleInfo> {
    Some(ModuleInfo {
        path: std::env::current_exe().ok()?,
        base: 0,
    })
}

fn default_modules() -> Arc<dyn ModuleResolver> {
    #[cfg(unix)]
    {
        Arc::new(DladdrModules)
    }
    #[cfg(not(unix))]
    {
        Arc::new(NoSymbols)
    }
}

/// Frames walked past the depth limit to cover the crash handler itself.
const HANDLER_FRAMES: usize = 48;

/// `(ip, sp)` of up to `limit` frames, innermost first. `sp` is 0 when the
/// unwinder cannot recover it.
#[inline(never)]
fn walk(limit: usize) -> Vec<(u64, u64)> {
    let mut frames = Vec::with_capacity(limit);
    if limit == 0 {
        return frames;
    }
    backtrace::trace(|frame| {
        frames.push((frame.ip() as usize as u64, frame.sp() as usize as u64));
        frames.len() < limit
    });
    frames
}

/// Captures and resolves the host call stack.
#[derive(Clone)]
pub struct NativeStackWalker {
    max_depth: usize,
    symbols: Arc<dyn SymbolResolver>,
    modules: Arc<dyn ModuleResolver>,
}

impl Default for NativeStackWalker {
    fn default() -> Self {
        Self::new(DEFAULT_NATIVE_FRAMES)
    }
}

impl NativeStackWalker {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            symbols: Arc::new(BacktraceSymbols::new()),
            modules: default_modules(),
        }
    }

    pub fn with_resolvers(
        max_depth: usize,
        symbols: Arc<dyn SymbolResolver>,
        modules: Arc<dyn ModuleResolver>,
    ) -> Self {
        Self {
            max_depth,
            symbols,
            modules,
        }
    }

    pub const fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Return addresses of the calling thread, innermost first.
    #[inline(never)]
    pub fn capture(&self) -> Vec<u64> {
        walk(self.max_depth).into_iter().map(|(ip, _)| ip).collect()
    }

    /// Return addresses from the fault point outwards.
    ///
    /// The walk starts at the frame executing `fault_ip` if there is one.
    /// Otherwise it starts past the frame owning `canary`, the address of a
    /// local in the outermost crash handler frame; frames without a stack
    /// pointer disable that cut and the whole stack is kept.
    #[inline(never)]
    pub fn capture_from(&self, fault_ip: u64, canary: u64) -> Vec<u64> {
        if self.max_depth == 0 {
            return Vec::new();
        }
        let frames = walk(self.max_depth + HANDLER_FRAMES);
        let start = frames
            .iter()
            .position(|&(ip, _)| fault_ip != 0 && ip == fault_ip)
            .or_else(|| {
                frames
                    .iter()
                    .position(|&(_, sp)| sp > canary)
                    .map(|owner| owner + 1)
            })
            .unwrap_or(0);
        frames[start..]
            .iter()
            .take(self.max_depth)
            .map(|&(ip, _)| ip)
            .collect()
    }

    /// Resolve `addresses` one at a time.
    pub fn frames<'a>(&'a self, addresses: &'a [u64]) -> impl Iterator<Item = NativeFrame> + 'a {
        addresses
            .iter()
            .map(|&address| self.resolve(address))
    }

    pub fn resolve(&self, address: u64) -> NativeFrame {
        resolve_frame(address, self.symbols.as_ref(), self.modules.as_ref())
    }

    pub fn module_info(&self, address: u64) -> Option<ModuleInfo> {
        self.modules.module(address)
    }
}
