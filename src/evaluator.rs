//! The trampoline installer.
//!
//! [`trampoline_evaluator`] is the frame-evaluation hook installed while the
//! subsystem is active. The fast path is a single extra-slot load per frame;
//! the slow path takes the subsystem lock once per code object to mint a
//! stub, publish its symbol, and cache it.

use std::mem;
use std::os::raw::{c_int, c_void};
use std::ptr;

use crate::error::Error;
use crate::host::{HostInterpreter, TrampolineFn};
use crate::Status;

/// The frame evaluator installed by `init(true)`.
///
/// Never surfaces an error: every failure falls back to the host's default
/// evaluator, so evaluation results are unaffected by profiling problems.
pub(crate) unsafe extern "C" fn trampoline_evaluator(
    tstate: *mut c_void,
    frame: *mut c_void,
    throw_flag: c_int,
) -> *mut c_void {
    let Some(host) = crate::registered_host() else {
        // The hook is only installed after a host registration.
        return ptr::null_mut();
    };
    let default_eval = host.default_eval();
    if crate::status() != Status::Ok {
        return default_eval(tstate, frame, throw_flag);
    }
    let code = host.frame_code(frame);
    match trampoline_for_code(host, code) {
        Some(trampoline) => {
            let f: TrampolineFn = mem::transmute(trampoline);
            f(tstate, frame, throw_flag, default_eval)
        }
        None => default_eval(tstate, frame, throw_flag),
    }
}

/// The cached trampoline of `code`, minting and publishing one on first use.
pub(crate) unsafe fn trampoline_for_code(
    host: &dyn HostInterpreter,
    code: *mut c_void,
) -> Option<*const u8> {
    let index = crate::extra_index()?;
    let cached = host.code_extra(code, index);
    if !cached.is_null() {
        return Some(cached as *const u8);
    }
    mint_and_publish(host, code, index).ok()
}

/// Mint, publish, cache. The extra slot is re-checked under the subsystem
/// lock so that concurrent first evaluations of one code object publish
/// exactly one symbol.
pub(crate) unsafe fn mint_and_publish(
    host: &dyn HostInterpreter,
    code: *mut c_void,
    index: u32,
) -> Result<*const u8, Error> {
    let mut subsys = crate::subsystem_lock();
    let cached = host.code_extra(code, index);
    if !cached.is_null() {
        return Ok(cached as *const u8);
    }

    let padding = subsys.backends.code_padding();
    let trampoline = match subsys.arenas.mint(padding) {
        Ok(trampoline) => trampoline,
        Err(err) => {
            crate::set_status(Status::Failed);
            log::warn!("could not mint a perf trampoline, disabling the subsystem: {err}");
            return Err(err);
        }
    };

    subsys.backends.ensure_state();
    if let Some(state) = &subsys.backends.state {
        let symbol = symbol_for_code(host, code);
        if let Err(err) = state.write_entry(trampoline.ptr, trampoline.code_size, &symbol) {
            // Best effort: a missing symbol costs one uncategorized sample.
            log::warn!("could not publish perf trampoline symbol {symbol}: {err}");
        }
    }

    // Publication store: later cache hits on any thread see a trampoline
    // whose symbol is already on disk.
    host.set_code_extra(code, index, trampoline.ptr as *mut c_void);
    Ok(trampoline.ptr)
}

pub(crate) unsafe fn symbol_for_code(host: &dyn HostInterpreter, code: *mut c_void) -> String {
    let qualname = host.code_qualname(code).unwrap_or_default();
    let filename = host.code_filename(code).unwrap_or_default();
    symbol_string(&qualname, &filename)
}

fn symbol_string(qualname: &str, filename: &str) -> String {
    format!("py::{qualname}:{filename}")
}
