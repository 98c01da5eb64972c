use thiserror::Error;

/// The error type used in this crate.
///
/// The frame-evaluation fast path never surfaces errors; it falls back to the
/// host's default evaluator instead. Errors are returned from the lifecycle
/// entry points (`init`, `fini`, `set_backend`, `after_fork_child`) and from
/// the backends' record writers.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Mapping or protecting an executable code arena failed. The subsystem
    /// transitions to the failed state and every evaluation falls back to the
    /// default evaluator until `fini` + `init`.
    #[error("Could not allocate an executable code arena: {0}")]
    AllocationFailure(#[source] std::io::Error),

    /// `init` was called while a foreign frame-evaluation hook was installed.
    #[error("A foreign frame-evaluation hook is already installed")]
    HookConflict,

    /// `init` was called before a host interpreter was registered with
    /// [`set_host`](crate::set_host).
    #[error("No host interpreter has been registered")]
    HostNotRegistered,

    /// The host interpreter could not reserve a per-code-object extra-data
    /// slot for the trampoline cache.
    #[error("The host interpreter has no free code extra-data slot")]
    ExtraSlotUnavailable,

    /// A backend could not create its state. The jitdump backend retries
    /// lazily on the next publication; the perf-map backend is best-effort.
    #[error("Backend initialization failed: {0}")]
    BackendInit(#[source] std::io::Error),

    /// Appending a line to `/tmp/perf-<pid>.map` failed.
    #[error("Could not write a perf map entry: {0}")]
    PerfMapWrite(#[source] std::io::Error),

    /// Copying the parent's perf map into the forked child failed.
    #[error("Could not copy the parent's perf map file: {0}")]
    PerfMapCopy(#[source] std::io::Error),

    /// Writing a record to `/tmp/jit-<pid>.dump` failed. Treated as permanent
    /// for that record; the file is flushed per record pair so a truncated
    /// dump still ends on a record boundary.
    #[error("Could not write a jitdump record: {0}")]
    JitDumpWrite(#[source] std::io::Error),

    /// `after_fork_child` ran with fork persistence enabled while the active
    /// backend was not the perf-map backend.
    #[error("Persist-after-fork requires the perf map backend")]
    ForkPolicyMismatch,
}
