//! Per-function native trampolines that make interpreter frames visible to
//! Linux `perf`.
//!
//! Native sampling profilers only unwind native stack frames, so every
//! user-level function of a bytecode interpreter normally collapses onto the
//! single symbol of the dispatch loop. This crate interposes on the host
//! interpreter's frame-evaluation hook and lazily mints a tiny executable
//! stub per code object. Each stub forwards the evaluation to the default
//! evaluator and is published under the code object's qualified name, so the
//! profiler attributes samples to the function that was actually running.
//!
//! Two publication backends exist: [`PerfMapBackend`] appends text lines to
//! `/tmp/perf-<pid>.map`, and [`JitDumpBackend`] writes a binary
//! `/tmp/jit-<pid>.dump` with synthesized DWARF unwind info, for
//! `perf inject -j`.
//!
//! The subsystem is process-global. The host registers its seam once with
//! [`set_host`], picks a backend with [`set_backend`], and toggles the hook
//! with [`init`]/[`fini`]; it must serialize those lifecycle calls. Frame
//! evaluation itself may happen on any thread.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! # fn host() -> &'static dyn perf_trampoline::HostInterpreter { unimplemented!() }
//! perf_trampoline::set_host(host());
//! perf_trampoline::set_backend(Arc::new(perf_trampoline::PerfMapBackend));
//! perf_trampoline::init(true).unwrap();
//! // ... run user code; every evaluated function gets a perf symbol ...
//! perf_trampoline::fini();
//! perf_trampoline::free_arenas();
//! ```

#[cfg(not(unix))]
compile_error!("the perf trampoline subsystem requires a Unix-like host");

mod arena;
mod backend;
mod eh_frame;
mod error;
mod evaluator;
mod host;
mod jitdump;
mod perf_map;
mod template;

use std::os::raw::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub use arena::ArenaInfo;
pub use backend::{Backend, BackendKind, BackendState};
pub use error::Error;
pub use host::{EvalFrameFn, HostInterpreter};
pub use jitdump::JitDumpBackend;
pub use perf_map::PerfMapBackend;

use arena::ArenaList;
use backend::BackendSlot;

/// Process-wide subsystem status, readable without the subsystem lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Status {
    NoInit = 0,
    Ok = 1,
    Failed = 2,
}

static STATUS: AtomicU8 = AtomicU8::new(Status::NoInit as u8);

const INVALID_EXTRA_INDEX: u32 = u32::MAX;
static EXTRA_INDEX: AtomicU32 = AtomicU32::new(INVALID_EXTRA_INDEX);

static PERSIST_AFTER_FORK: AtomicBool = AtomicBool::new(false);

type HostRef = &'static dyn HostInterpreter;
static HOST: AtomicPtr<HostRef> = AtomicPtr::new(ptr::null_mut());

/// Everything mutated on the slow path, behind one lock: the arena list and
/// the backend slot.
pub(crate) struct Subsystem {
    pub arenas: ArenaList,
    pub backends: BackendSlot,
}

static SUBSYSTEM: Mutex<Subsystem> = Mutex::new(Subsystem {
    arenas: ArenaList::new(),
    backends: BackendSlot::new(),
});

pub(crate) fn subsystem_lock() -> MutexGuard<'static, Subsystem> {
    SUBSYSTEM.lock().unwrap()
}

pub(crate) fn status() -> Status {
    match STATUS.load(Ordering::Acquire) {
        1 => Status::Ok,
        2 => Status::Failed,
        _ => Status::NoInit,
    }
}

pub(crate) fn set_status(status: Status) {
    STATUS.store(status as u8, Ordering::Release);
}

pub(crate) fn extra_index() -> Option<u32> {
    match EXTRA_INDEX.load(Ordering::Acquire) {
        INVALID_EXTRA_INDEX => None,
        index => Some(index),
    }
}

pub(crate) fn registered_host() -> Option<&'static dyn HostInterpreter> {
    let cell = HOST.load(Ordering::Acquire);
    if cell.is_null() {
        None
    } else {
        Some(unsafe { *cell })
    }
}

fn fn_eq(a: EvalFrameFn, b: EvalFrameFn) -> bool {
    a as usize == b as usize
}

/// Register the host interpreter seam. Must happen before [`init`].
///
/// A replaced registration leaks one pointer-sized box; hosts register once
/// per process.
pub fn set_host(host: &'static dyn HostInterpreter) {
    let cell = Box::into_raw(Box::new(host));
    HOST.store(cell, Ordering::Release);
}

/// Enable (`activate`) or disable the trampoline frame-evaluation hook.
///
/// Activation installs the hook, maps the first code arena, reserves the
/// per-code extra-data slot, and creates the backend state if a backend is
/// registered. Fails with [`Error::HookConflict`] if a foreign hook is
/// installed, and with [`Error::AllocationFailure`] (leaving the subsystem
/// in the failed, always-fall-back state) if the arena cannot be mapped.
pub fn init(activate: bool) -> Result<(), Error> {
    let host = registered_host().ok_or(Error::HostNotRegistered)?;
    let ours: EvalFrameFn = evaluator::trampoline_evaluator;
    let default = host.default_eval();
    let current = host.installed_eval();
    if !fn_eq(current, default) && !fn_eq(current, ours) {
        return Err(Error::HookConflict);
    }

    if !activate {
        host.install_eval(default);
        set_status(Status::NoInit);
        return Ok(());
    }

    host.install_eval(ours);
    if extra_index().is_none() {
        let index = host
            .reserve_code_extra_index()
            .ok_or(Error::ExtraSlotUnavailable)?;
        EXTRA_INDEX.store(index, Ordering::Release);
    }
    {
        let mut subsys = subsystem_lock();
        if subsys.arenas.is_empty() {
            let padding = subsys.backends.code_padding();
            if let Err(err) = subsys.arenas.grow(padding) {
                set_status(Status::Failed);
                return Err(err);
            }
        }
        subsys.backends.ensure_state();
    }
    set_status(Status::Ok);
    Ok(())
}

/// Disable the hook and release the backend state.
///
/// No-op unless the subsystem is currently in the active state. Arenas are
/// kept: outstanding code objects may still hold trampoline pointers. Use
/// [`free_arenas`] during full process teardown.
pub fn fini() {
    if status() != Status::Ok {
        return;
    }
    if let Some(host) = registered_host() {
        let ours: EvalFrameFn = evaluator::trampoline_evaluator;
        if fn_eq(host.installed_eval(), ours) {
            host.install_eval(host.default_eval());
        }
    }
    subsystem_lock().backends.release_state();
    EXTRA_INDEX.store(INVALID_EXTRA_INDEX, Ordering::Release);
    set_status(Status::NoInit);
}

/// Pre-mint and publish a trampoline for `code` without evaluating it.
///
/// No-op while the subsystem is inactive or failed. A later evaluation of
/// `code` reuses the trampoline installed here.
///
/// # Safety
///
/// `code` must be a live code object of the registered host.
pub unsafe fn compile_code(code: *mut c_void) -> Result<(), Error> {
    if status() != Status::Ok {
        return Ok(());
    }
    let host = registered_host().ok_or(Error::HostNotRegistered)?;
    let Some(index) = extra_index() else {
        return Ok(());
    };
    if !host.code_extra(code, index).is_null() {
        return Ok(());
    }
    evaluator::mint_and_publish(host, code, index).map(|_| ())
}

/// Whether our frame-evaluation hook is currently installed.
pub fn is_active() -> bool {
    let Some(host) = registered_host() else {
        return false;
    };
    let ours: EvalFrameFn = evaluator::trampoline_evaluator;
    fn_eq(host.installed_eval(), ours)
}

/// Unmap every code arena, newest first.
///
/// Call only during full process teardown, after [`fini`], once no cached
/// trampoline can still execute.
pub fn free_arenas() {
    subsystem_lock().arenas.release();
}

/// Register a symbol-publication backend, replacing the current one.
///
/// If a backend is active its state is released first (via [`fini`]); the
/// new backend's state is created on the next [`init`] or lazily on the
/// first publication after it.
pub fn set_backend(backend: Arc<dyn Backend>) {
    let active = subsystem_lock().backends.state.is_some();
    if active {
        fini();
    }
    let mut subsys = subsystem_lock();
    subsys.backends.backend = Some(backend);
    subsys.backends.state = None;
}

/// The currently registered backend, if any.
pub fn backend() -> Option<Arc<dyn Backend>> {
    subsystem_lock().backends.backend.clone()
}

/// The kind of the *active* backend: [`BackendKind::Unset`] while no backend
/// state is live.
pub fn backend_kind() -> BackendKind {
    subsystem_lock().backends.active_kind()
}

/// Set whether trampolines persist into forked children, returning the new
/// value.
///
/// Persistence only works with the perf-map backend: the child inherits the
/// parent's executable mappings and a copy of its map file. The jitdump
/// backend cannot persist (the dump is tied to the parent pid), so a child
/// restarts fresh instead.
pub fn set_persist_after_fork(enable: bool) -> bool {
    PERSIST_AFTER_FORK.store(enable, Ordering::Release);
    enable
}

/// Apply the fork policy in a freshly forked child.
///
/// With persistence enabled the active backend must be the perf-map backend;
/// the subsystem is shut down and the parent's map file is copied to the
/// child's path, so inherited trampolines keep their symbols. Without
/// persistence the subsystem shuts down and, if it was active, restarts with
/// fresh backend state under the child's pid.
pub fn after_fork_child() -> Result<(), Error> {
    if PERSIST_AFTER_FORK.load(Ordering::Acquire) {
        let kind = backend_kind();
        fini();
        if kind != BackendKind::Map {
            return Err(Error::ForkPolicyMismatch);
        }
        perf_map::copy_parent_map_file()
    } else {
        let was_active = is_active();
        fini();
        if was_active {
            init(true)?;
        }
        Ok(())
    }
}

/// Snapshot of the live arenas, for diagnostics and invariant checks.
pub fn arena_stats() -> Vec<ArenaInfo> {
    subsystem_lock().arenas.stats()
}
