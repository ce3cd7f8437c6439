//! How the process ends after a crash has been recorded.

use tracing::debug;

/// Exit code used by both termination modes.
pub const CRASH_EXIT_CODE: i32 = 0;

/// Termination policy, configured up front.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TerminationPolicy {
    /// Normal exit: atexit handlers and buffered std streams run.
    #[default]
    Clean,
    /// Immediate `_exit`, no user-space cleanup.
    Forced,
    /// Forced when any of the named shared objects is already loaded in the
    /// process, clean otherwise. Useful when an injected hook library is known
    /// to deadlock during normal shutdown.
    ForcedIfLoaded(Vec<String>),
}

/// Termination mode chosen for one crash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Exit,
    Forced,
}

impl TerminationPolicy {
    /// Decide how to terminate right now.
    pub fn resolve(&self) -> Termination {
        match self {
            Self::Clean => Termination::Exit,
            Self::Forced => Termination::Forced,
            Self::ForcedIfLoaded(modules) => {
                if modules.iter().any(|m| is_module_loaded(m)) {
                    Termination::Forced
                } else {
                    Termination::Exit
                }
            }
        }
    }
}

/// True if `name` is already mapped into the process. Never loads anything.
#[cfg(unix)]
pub fn is_module_loaded(name: &str) -> bool {
    use libloading::os::unix::Library;

    // SAFETY: RTLD_NOLOAD only bumps the refcount of an already-loaded
    // object, so no initializers run.
    match unsafe { Library::open(Some(name), libc::RTLD_NOLOAD | libc::RTLD_LAZY) } {
        Ok(lib) => {
            debug!(module = name, "module is loaded");
            drop(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_module_loaded(_name: &str) -> bool {
    false
}

/// Ends the process.
pub trait Terminator: Send + Sync {
    fn terminate(&self, mode: Termination);
}

/// Terminator that actually exits.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, mode: Termination) {
        match mode {
            Termination::Exit => std::process::exit(CRASH_EXIT_CODE),
            // SAFETY: _exit has no preconditions.
            Termination::Forced => unsafe { libc::_exit(CRASH_EXIT_CODE) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_policies() {
        assert_eq!(TerminationPolicy::default().resolve(), Termination::Exit);
        assert_eq!(TerminationPolicy::Forced.resolve(), Termination::Forced);
    }

    #[test]
    fn test_forced_if_loaded_absent() {
        let policy = TerminationPolicy::ForcedIfLoaded(vec!["libdoesnotexist_emucrash.so".into()]);
        assert_eq!(policy.resolve(), Termination::Exit);
        assert_eq!(
            TerminationPolicy::ForcedIfLoaded(Vec::new()).resolve(),
            Termination::Exit
        );
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_forced_if_loaded_present() {
        let policy = TerminationPolicy::ForcedIfLoaded(vec![
            "libdoesnotexist_emucrash.so".into(),
            "libc.so.6".into(),
        ]);
        assert_eq!(policy.resolve(), Termination::Forced);
    }
}
