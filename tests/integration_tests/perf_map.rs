use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use perf_trampoline::{arena_stats, compile_code, fini, init, set_backend, PerfMapBackend};

use crate::fake_interpreter::{evaluate, expected_result, session, TestCode, TestFrame};

fn map_path(pid: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/perf-{pid}.map"))
}

fn own_map_path() -> PathBuf {
    map_path(std::process::id())
}

fn remove_own_map_file() {
    let _ = fs::remove_file(own_map_path());
}

#[test]
fn publishes_one_line_per_code_object() {
    let s = session();
    remove_own_map_file();
    set_backend(Arc::new(PerfMapBackend));
    init(true).unwrap();

    let code = TestCode::new(Some("foo"), Some("/t/a.py"));
    let frame = TestFrame::new(&code);
    let result = evaluate(s.host, &frame, 0);
    assert_eq!(result, expected_result(frame.as_ptr(), 0));
    // Repeated evaluation publishes nothing new.
    evaluate(s.host, &frame, 0);
    evaluate(s.host, &frame, 1);

    let index = s.host.last_extra_index().unwrap();
    let cached = code.extra_at(index);
    fini();

    let contents = fs::read_to_string(own_map_path()).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 1);

    let mut fields = lines[0].splitn(3, ' ');
    let addr = usize::from_str_radix(fields.next().unwrap(), 16).unwrap();
    let size = usize::from_str_radix(fields.next().unwrap(), 16).unwrap();
    let symbol = fields.next().unwrap();
    assert_eq!(addr, cached);
    let stats = arena_stats();
    assert!(stats.iter().any(|arena| arena.contains(addr)));
    assert_eq!(size, stats[0].template_len);
    assert_eq!(symbol, "py::foo:/t/a.py");
}

#[test]
fn missing_names_become_empty_components() {
    let s = session();
    remove_own_map_file();
    set_backend(Arc::new(PerfMapBackend));
    init(true).unwrap();

    let cases = [
        (TestCode::new(None, Some("/t/a.py")), "py:::/t/a.py"),
        (TestCode::new(Some("X"), None), "py::X:"),
        (TestCode::new(None, None), "py:::"),
    ];
    for (code, _) in &cases {
        let frame = TestFrame::new(code);
        evaluate(s.host, &frame, 0);
    }
    fini();

    let contents = fs::read_to_string(own_map_path()).unwrap();
    let symbols: Vec<&str> = contents
        .lines()
        .map(|line| line.splitn(3, ' ').nth(2).unwrap())
        .collect();
    let expected: Vec<&str> = cases.iter().map(|(_, symbol)| *symbol).collect();
    assert_eq!(symbols, expected);
}

#[test]
fn compile_code_pre_mints_the_trampoline() {
    let s = session();
    remove_own_map_file();
    set_backend(Arc::new(PerfMapBackend));
    init(true).unwrap();

    let code = TestCode::new(Some("eager"), Some("/t/e.py"));
    unsafe { compile_code(code.as_ptr()) }.unwrap();
    let index = s.host.last_extra_index().unwrap();
    let pre_minted = code.extra_at(index);
    assert_ne!(pre_minted, 0);

    // A later evaluation reuses the pre-minted trampoline and publishes no
    // second symbol.
    let frame = TestFrame::new(&code);
    let result = evaluate(s.host, &frame, 0);
    assert_eq!(result, expected_result(frame.as_ptr(), 0));
    assert_eq!(code.extra_at(index), pre_minted);
    fini();

    let contents = fs::read_to_string(own_map_path()).unwrap();
    assert_eq!(contents.lines().count(), 1);
}

#[test]
fn overflowing_an_arena_links_a_new_one() {
    let s = session();
    remove_own_map_file();
    set_backend(Arc::new(PerfMapBackend));
    init(true).unwrap();

    let stats = arena_stats();
    let arenas_before = stats.len();
    let last = stats.last().unwrap();
    let free_slots = last.remaining / last.chunk_size;

    // Fill the tail of the current arena, then one more to force a new one.
    let mut codes = Vec::with_capacity(free_slots + 1);
    for i in 0..free_slots + 1 {
        let code = TestCode::new(Some(&format!("f{i}")), Some("/t/many.py"));
        unsafe { compile_code(code.as_ptr()) }.unwrap();
        codes.push(code);
    }

    let stats = arena_stats();
    assert_eq!(stats.len(), arenas_before + 1);
    let full = &stats[arenas_before - 1];
    assert!(full.remaining < full.chunk_size);

    // Earlier trampolines stay where they were; the overflow trampoline is
    // in the fresh arena.
    let index = s.host.last_extra_index().unwrap();
    if free_slots > 0 {
        assert!(full.contains(codes[0].extra_at(index)));
    }
    let overflow = codes.last().unwrap().extra_at(index);
    assert!(stats[arenas_before].contains(overflow));
    fini();
}

#[cfg(any(target_os = "android", target_os = "linux"))]
mod fork {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};
    use perf_trampoline::{
        after_fork_child, is_active, set_persist_after_fork, Error, JitDumpBackend,
    };

    #[test]
    fn fork_persist_copies_the_map_file() {
        let s = session();
        remove_own_map_file();
        set_backend(Arc::new(PerfMapBackend));
        init(true).unwrap();

        let code_a = TestCode::new(Some("a"), Some("/t/fork.py"));
        let code_b = TestCode::new(Some("b"), Some("/t/fork.py"));
        evaluate(s.host, &TestFrame::new(&code_a), 0);
        evaluate(s.host, &TestFrame::new(&code_b), 0);
        let parent_bytes = fs::read(own_map_path()).unwrap();
        assert_eq!(parent_bytes.iter().filter(|&&b| b == b'\n').count(), 2);

        set_persist_after_fork(true);
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let copied = after_fork_child().is_ok()
                    && fs::read(own_map_path()).ok().as_deref() == Some(&parent_bytes[..]);
                unsafe { libc::_exit(if copied { 0 } else { 1 }) }
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).unwrap();
                assert_eq!(status, WaitStatus::Exited(child, 0));
                let _ = fs::remove_file(map_path(child.as_raw() as u32));
            }
        }
        fini();
    }

    #[test]
    fn fork_persist_requires_the_map_backend() {
        let _s = session();
        set_backend(Arc::new(JitDumpBackend));
        init(true).unwrap();
        set_persist_after_fork(true);

        // The policy check itself does not need a real fork.
        let err = after_fork_child().unwrap_err();
        assert!(matches!(err, Error::ForkPolicyMismatch));
        assert!(!is_active());
        let _ = fs::remove_file(format!("/tmp/jit-{}.dump", std::process::id()));
    }
}
