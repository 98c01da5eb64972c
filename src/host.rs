use std::os::raw::{c_int, c_void};

/// Raw frame-evaluator signature shared with the host interpreter.
///
/// This is the function the interpreter's dispatch loop calls for every frame:
/// thread state, frame, and a "throw" flag, returning the evaluation result.
/// All three are opaque to this crate.
pub type EvalFrameFn =
    unsafe extern "C" fn(tstate: *mut c_void, frame: *mut c_void, throw_flag: c_int) -> *mut c_void;

/// Signature of a minted trampoline.
///
/// The assembly template forwards its first three arguments to the evaluator
/// passed in the fourth argument register and returns its result.
pub(crate) type TrampolineFn = unsafe extern "C" fn(
    tstate: *mut c_void,
    frame: *mut c_void,
    throw_flag: c_int,
    eval: EvalFrameFn,
) -> *mut c_void;

/// What the trampoline subsystem needs from the host interpreter.
///
/// Code objects and frames cross this seam as opaque `*mut c_void`. The host
/// guarantees that a frame pointer passed to the installed evaluator stays
/// valid for the duration of that call, and that a code object outlives every
/// frame executing it.
///
/// The accessors on this trait are called from the evaluation fast path on
/// arbitrary threads; implementations must not re-enter the subsystem.
pub trait HostInterpreter: Send + Sync {
    /// The interpreter's stock frame evaluator.
    fn default_eval(&self) -> EvalFrameFn;

    /// The frame evaluator that is currently installed.
    fn installed_eval(&self) -> EvalFrameFn;

    /// Install `eval` as the frame evaluator.
    fn install_eval(&self, eval: EvalFrameFn);

    /// Reserve an extra-data slot index on code objects, or `None` if the
    /// host has run out of slots.
    fn reserve_code_extra_index(&self) -> Option<u32>;

    /// The code object executed by `frame`.
    ///
    /// # Safety
    ///
    /// `frame` must be a frame pointer the host passed to the installed
    /// evaluator and must still be live.
    unsafe fn frame_code(&self, frame: *mut c_void) -> *mut c_void;

    /// Read the extra-data slot `index` of `code`. Null means unset.
    ///
    /// # Safety
    ///
    /// `code` must be a live code object of this host and `index` an index
    /// previously returned by [`reserve_code_extra_index`].
    ///
    /// [`reserve_code_extra_index`]: HostInterpreter::reserve_code_extra_index
    unsafe fn code_extra(&self, code: *mut c_void, index: u32) -> *mut c_void;

    /// Store `value` into the extra-data slot `index` of `code`.
    ///
    /// The store must be observable to other threads before a subsequent
    /// [`code_extra`](HostInterpreter::code_extra) on any thread returns it.
    ///
    /// # Safety
    ///
    /// Same requirements as [`code_extra`](HostInterpreter::code_extra).
    unsafe fn set_code_extra(&self, code: *mut c_void, index: u32, value: *mut c_void);

    /// The qualified name of `code`, if it has one.
    ///
    /// # Safety
    ///
    /// `code` must be a live code object of this host.
    unsafe fn code_qualname(&self, code: *mut c_void) -> Option<String>;

    /// The source filename of `code`, if it has one.
    ///
    /// # Safety
    ///
    /// `code` must be a live code object of this host.
    unsafe fn code_filename(&self, code: *mut c_void) -> Option<String>;
}
