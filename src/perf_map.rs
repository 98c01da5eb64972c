//! The perf-map backend.
//!
//! Writes one text line per trampoline to `/tmp/perf-<pid>.map`, the sidecar
//! format `perf` consults to name anonymous executable regions. The file is
//! opened lazily in append mode and each line is emitted with a single
//! `write_all`, so concurrent writers (including forked children before the
//! copy) never interleave within a line.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::backend::{Backend, BackendKind, BackendState};
use crate::error::Error;

pub struct PerfMapBackend;

impl Backend for PerfMapBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Map
    }

    fn init_state(&self) -> Result<Box<dyn BackendState>, Error> {
        Ok(Box::new(PerfMapState {
            file: Mutex::new(None),
        }))
    }
}

struct PerfMapState {
    /// Lazily opened appender for this process's map file.
    file: Mutex<Option<File>>,
}

impl BackendState for PerfMapState {
    unsafe fn write_entry(
        &self,
        code_addr: *const u8,
        code_size: usize,
        symbol: &str,
    ) -> Result<(), Error> {
        let mut guard = self.file.lock().unwrap();
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(map_path(process_id()))
                .map_err(Error::PerfMapWrite)?;
            *guard = Some(file);
        }
        let line = map_line(code_addr as usize, code_size, symbol);
        guard
            .as_mut()
            .expect("map file was just opened")
            .write_all(line.as_bytes())
            .map_err(Error::PerfMapWrite)
    }
}

fn map_line(addr: usize, size: usize, symbol: &str) -> String {
    format!("{addr:x} {size:x} {symbol}\n")
}

fn process_id() -> u32 {
    std::process::id()
}

pub(crate) fn map_path(pid: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/perf-{pid}.map"))
}

/// Copy the parent process's map file to this process's path, for children
/// that keep the parent's trampolines alive across a fork.
pub(crate) fn copy_parent_map_file() -> Result<(), Error> {
    let parent = map_path(unsafe { libc::getppid() } as u32);
    let child = map_path(process_id());
    std::fs::copy(&parent, &child)
        .map(|_| ())
        .map_err(Error::PerfMapCopy)
}
