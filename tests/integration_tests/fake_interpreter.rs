//! A minimal fake interpreter for exercising the trampoline subsystem.
//!
//! The subsystem state is process-global, so every test takes a [`session`]
//! first: it serializes the tests, registers the shared host on first use,
//! and resets leftover state from the previous test.

use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use perf_trampoline::{EvalFrameFn, HostInterpreter};

pub const MAX_EXTRA_SLOTS: usize = 32;

/// A code object of the fake interpreter, addressed as an opaque pointer
/// across the host seam.
pub struct TestCode {
    qualname: Option<String>,
    filename: Option<String>,
    extra: [AtomicUsize; MAX_EXTRA_SLOTS],
}

impl TestCode {
    pub fn new(qualname: Option<&str>, filename: Option<&str>) -> Box<TestCode> {
        Box::new(TestCode {
            qualname: qualname.map(str::to_owned),
            filename: filename.map(str::to_owned),
            extra: std::array::from_fn(|_| AtomicUsize::new(0)),
        })
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self as *const TestCode as *mut c_void
    }

    pub fn extra_at(&self, index: u32) -> usize {
        self.extra[index as usize].load(Ordering::Acquire)
    }
}

pub struct TestFrame {
    code: *mut c_void,
}

impl TestFrame {
    pub fn new(code: &TestCode) -> TestFrame {
        TestFrame {
            code: code.as_ptr(),
        }
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self as *const TestFrame as *mut c_void
    }
}

pub static DEFAULT_EVAL_CALLS: AtomicUsize = AtomicUsize::new(0);

/// The fake interpreter's stock evaluator: returns a value derived from its
/// arguments so tests can check that results pass through trampolines
/// unchanged.
pub unsafe extern "C" fn default_eval(
    _tstate: *mut c_void,
    frame: *mut c_void,
    throw_flag: c_int,
) -> *mut c_void {
    DEFAULT_EVAL_CALLS.fetch_add(1, Ordering::AcqRel);
    expected_result(frame, throw_flag)
}

pub fn expected_result(frame: *mut c_void, throw_flag: c_int) -> *mut c_void {
    (frame as usize ^ throw_flag as usize ^ 0x517) as *mut c_void
}

pub struct FakeInterpreter {
    /// The installed evaluator as a usize; zero means the default.
    eval: AtomicUsize,
    next_extra: AtomicU32,
}

impl FakeInterpreter {
    fn new() -> FakeInterpreter {
        FakeInterpreter {
            eval: AtomicUsize::new(0),
            next_extra: AtomicU32::new(0),
        }
    }

    /// The extra-slot index handed out most recently.
    pub fn last_extra_index(&self) -> Option<u32> {
        self.next_extra.load(Ordering::Acquire).checked_sub(1)
    }
}

impl HostInterpreter for FakeInterpreter {
    fn default_eval(&self) -> EvalFrameFn {
        default_eval
    }

    fn installed_eval(&self) -> EvalFrameFn {
        match self.eval.load(Ordering::Acquire) {
            0 => default_eval,
            addr => unsafe { std::mem::transmute::<usize, EvalFrameFn>(addr) },
        }
    }

    fn install_eval(&self, eval: EvalFrameFn) {
        self.eval.store(eval as usize, Ordering::Release);
    }

    fn reserve_code_extra_index(&self) -> Option<u32> {
        let index = self.next_extra.fetch_add(1, Ordering::AcqRel);
        (index < MAX_EXTRA_SLOTS as u32).then_some(index)
    }

    unsafe fn frame_code(&self, frame: *mut c_void) -> *mut c_void {
        (*(frame as *const TestFrame)).code
    }

    unsafe fn code_extra(&self, code: *mut c_void, index: u32) -> *mut c_void {
        (*(code as *const TestCode)).extra[index as usize].load(Ordering::Acquire) as *mut c_void
    }

    unsafe fn set_code_extra(&self, code: *mut c_void, index: u32, value: *mut c_void) {
        (*(code as *const TestCode)).extra[index as usize].store(value as usize, Ordering::Release);
    }

    unsafe fn code_qualname(&self, code: *mut c_void) -> Option<String> {
        (*(code as *const TestCode)).qualname.clone()
    }

    unsafe fn code_filename(&self, code: *mut c_void) -> Option<String> {
        (*(code as *const TestCode)).filename.clone()
    }
}

pub struct Session {
    pub host: &'static FakeInterpreter,
    _guard: MutexGuard<'static, ()>,
}

/// Serialize tests against the process-global subsystem and reset whatever
/// the previous test left behind.
pub fn session() -> Session {
    static LOCK: Mutex<()> = Mutex::new(());
    static HOST: OnceLock<&'static FakeInterpreter> = OnceLock::new();

    let guard = LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _ = env_logger::builder().is_test(true).try_init();
    let host = *HOST.get_or_init(|| {
        let host: &'static FakeInterpreter = Box::leak(Box::new(FakeInterpreter::new()));
        perf_trampoline::set_host(host);
        host
    });
    perf_trampoline::fini();
    perf_trampoline::set_persist_after_fork(false);
    host.install_eval(default_eval);
    Session {
        host,
        _guard: guard,
    }
}

/// Dispatch a frame the way the interpreter's loop would: through whatever
/// evaluator is currently installed.
pub fn evaluate(host: &FakeInterpreter, frame: &TestFrame, throw_flag: c_int) -> *mut c_void {
    let eval = host.installed_eval();
    unsafe { eval(std::ptr::null_mut(), frame.as_ptr(), throw_flag) }
}
