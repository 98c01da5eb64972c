//! The trampoline assembly template.
//!
//! One copy of this stub is handed out per code object. It establishes a
//! frame pointer, forwards its first three arguments to the evaluator passed
//! in the fourth argument register, and returns the evaluator's result, so a
//! native unwinder can walk through it with `fp` alone. The template is
//! bracketed by two exported symbols so its byte length is known at runtime.

use std::slice;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        // System V AMD64: tstate in rdi, frame in rsi, throw_flag in edx,
        // evaluator in rcx.
        core::arch::global_asm!(
            ".text",
            ".balign 16",
            ".globl perf_trampoline_template",
            ".globl perf_trampoline_template_end",
            "perf_trampoline_template:",
            "push rbp",
            "mov rbp, rsp",
            "call rcx",
            "pop rbp",
            "ret",
            "perf_trampoline_template_end:",
        );
    } else if #[cfg(target_arch = "aarch64")] {
        // AAPCS64: tstate in x0, frame in x1, throw_flag in w2, evaluator
        // in x3.
        core::arch::global_asm!(
            ".text",
            ".balign 16",
            ".globl perf_trampoline_template",
            ".globl perf_trampoline_template_end",
            "perf_trampoline_template:",
            "stp x29, x30, [sp, #-16]!",
            "mov x29, sp",
            "blr x3",
            "ldp x29, x30, [sp], #16",
            "ret",
            "perf_trampoline_template_end:",
        );
    } else {
        compile_error!("the perf trampoline template is only available on x86_64 and aarch64");
    }
}

extern "C" {
    fn perf_trampoline_template();
    fn perf_trampoline_template_end();
}

/// The template's bytes, between the two bracketing symbols.
pub(crate) fn template_bytes() -> &'static [u8] {
    let start = perf_trampoline_template as usize;
    let end = perf_trampoline_template_end as usize;
    unsafe { slice::from_raw_parts(start as *const u8, end - start) }
}

/// Make freshly copied code bytes coherent with the instruction cache.
///
/// Must run after the copy and before the first execution of any stub in the
/// range. x86_64 keeps its instruction cache coherent with data writes;
/// AArch64 requires an explicit clean-and-invalidate sequence.
#[allow(unused_variables)]
pub(crate) fn flush_instruction_cache(start: *const u8, len: usize) {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            // Coherent I-cache; nothing to do.
        } else if #[cfg(target_arch = "aarch64")] {
            // Clean the D-cache to the point of unification, then invalidate
            // the I-cache over the same range. 64 bytes is the minimum cache
            // line size on the cores we run on.
            const LINE: usize = 64;
            let start = start as usize;
            let end = start + len;
            unsafe {
                for addr in (start..end).step_by(LINE) {
                    core::arch::asm!("dc cvau, {addr}", addr = in(reg) addr, options(nostack));
                }
                core::arch::asm!("dsb ish", options(nostack));
                for addr in (start..end).step_by(LINE) {
                    core::arch::asm!("ic ivau, {addr}", addr = in(reg) addr, options(nostack));
                }
                core::arch::asm!("dsb ish", "isb", options(nostack));
            }
        }
    }
}
