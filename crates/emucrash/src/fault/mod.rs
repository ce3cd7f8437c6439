//! Fault sources: where crash events come from.

#[cfg(unix)]
mod signal;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::event::CrashEvent;

#[cfg(unix)]
pub use signal::{
    CRASH_SIGNALS, DebugCallback, DebugEvent, SignalFaultSource, install_debug_forwarder,
};

/// Called once per fault with the captured event.
pub type FaultCallback = Arc<dyn Fn(&CrashEvent) + Send + Sync>;

/// Process-wide fault interception.
pub trait FaultSource {
    /// Route faults to `callback`. Calling it again must not install a
    /// second set of hooks.
    ///
    /// # Errors
    ///
    /// Returns [`CrashError::HookInstall`](crate::CrashError::HookInstall)
    /// if the platform refuses a hook.
    fn on_fault(&self, callback: FaultCallback) -> Result<()>;
}

/// Fault source driven by hand, for previews and tests.
#[derive(Default)]
pub struct ManualFaultSource {
    callback: Mutex<Option<FaultCallback>>,
}

impl ManualFaultSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_installed(&self) -> bool {
        self.callback.lock().is_some()
    }

    /// Deliver `event` as if the platform had raised it. Returns `false` if
    /// nothing is listening.
    pub fn raise(&self, event: &CrashEvent) -> bool {
        let callback = self.callback.lock().clone();
        callback.is_some_and(|callback| {
            callback(event);
            true
        })
    }
}

impl FaultSource for ManualFaultSource {
    fn on_fault(&self, callback: FaultCallback) -> Result<()> {
        *self.callback.lock() = Some(callback);
        Ok(())
    }
}
