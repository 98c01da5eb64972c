//! The symbol-publication backend seam.
//!
//! A backend turns minted trampolines into something a profiler can see:
//! either a line in `/tmp/perf-<pid>.map` or a record pair in
//! `/tmp/jit-<pid>.dump`. Exactly one backend is active at a time; its state
//! lives from `init` (or the first lazy retry) until `fini`.

use std::sync::Arc;

use crate::error::Error;

/// Which backend family is currently active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// No backend state is live.
    Unset,
    /// The perf-map text backend.
    Map,
    /// The jitdump binary backend.
    JitDump,
}

/// A registered symbol-publication backend.
///
/// Registration carries no resources; the working state is created by
/// [`init_state`](Backend::init_state) when the subsystem activates and
/// dropped again at `fini`.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Extra bytes reserved after each template copy in the arenas. The
    /// jitdump backend parks its per-trampoline unwind info budget here.
    fn code_padding(&self) -> usize {
        0
    }

    /// Create the backend's working state.
    fn init_state(&self) -> Result<Box<dyn BackendState>, Error>;
}

/// Live state of the active backend.
///
/// Dropping the state releases the backend's resources (closes files, unmaps
/// the jitdump marker page).
pub trait BackendState: Send + Sync {
    /// Publish one trampoline.
    ///
    /// `symbol` is the full symbol string, `py::<qualname>:<filename>`.
    /// Failures are best-effort from the installer's point of view: a missing
    /// symbol means one uncategorized sample, not a broken evaluation.
    ///
    /// # Safety
    ///
    /// `code_addr` must point to `code_size` readable bytes that stay mapped
    /// for the duration of the call.
    unsafe fn write_entry(
        &self,
        code_addr: *const u8,
        code_size: usize,
        symbol: &str,
    ) -> Result<(), Error>;
}

/// The backend slot of the global subsystem state.
pub(crate) struct BackendSlot {
    pub backend: Option<Arc<dyn Backend>>,
    pub state: Option<Box<dyn BackendState>>,
}

impl BackendSlot {
    pub const fn new() -> BackendSlot {
        BackendSlot {
            backend: None,
            state: None,
        }
    }

    /// The active backend's kind; `Unset` while no state is live.
    pub fn active_kind(&self) -> BackendKind {
        match (&self.backend, &self.state) {
            (Some(backend), Some(_)) => backend.kind(),
            _ => BackendKind::Unset,
        }
    }

    pub fn code_padding(&self) -> usize {
        self.backend.as_ref().map_or(0, |b| b.code_padding())
    }

    /// Create the backend state if a backend is registered and none is live.
    /// Failure is logged and retried on the next call.
    pub fn ensure_state(&mut self) {
        if self.state.is_some() {
            return;
        }
        let Some(backend) = &self.backend else { return };
        match backend.init_state() {
            Ok(state) => self.state = Some(state),
            Err(err) => log::warn!("perf trampoline backend failed to initialize: {err}"),
        }
    }

    /// Drop the live state, releasing the backend's resources.
    pub fn release_state(&mut self) {
        self.state = None;
    }
}
