//! The jitdump backend.
//!
//! Writes `/tmp/jit-<pid>.dump`, the binary log `perf inject -j` consumes to
//! synthesize one shared object per JIT region. Every trampoline produces a
//! record pair: an unwinding-info record carrying a synthesized `.eh_frame`
//! plus `.eh_frame_hdr`, then a code-load record carrying the symbol name and
//! the stub's bytes. The file's first page is mapped executable from its own
//! descriptor; the resulting kernel mmap event is how `perf record` discovers
//! the dump.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::slice;
use std::sync::Mutex;

use byteorder::{LittleEndian, WriteBytesExt};
use memmap2::{Mmap, MmapOptions};

use crate::arena::page_size;
use crate::backend::{Backend, BackendKind, BackendState};
use crate::eh_frame::{self, round_up, EH_FRAME_HEADER_LEN};
use crate::error::Error;

const JITDUMP_MAGIC: u32 = 0x4A69_5444;
const JITDUMP_VERSION: u32 = 1;
const FILE_HEADER_LEN: u32 = 40;
const BASE_EVENT_LEN: usize = 16;

const JIT_CODE_LOAD: u32 = 0;
const JIT_CODE_UNWINDING_INFO: u32 = 4;

/// Per-trampoline arena padding reserved for unwind info. Every synthesized
/// `.eh_frame` must fit in this budget.
pub(crate) const CODE_PADDING: usize = 0x100;

const WRITE_BUFFER_LEN: usize = 2 * 1024 * 1024;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86")] {
        const ELF_MACHINE: u32 = 3;
    } else if #[cfg(target_arch = "x86_64")] {
        const ELF_MACHINE: u32 = 62;
    } else if #[cfg(target_arch = "arm")] {
        const ELF_MACHINE: u32 = 40;
    } else if #[cfg(target_arch = "aarch64")] {
        const ELF_MACHINE: u32 = 183;
    } else if #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))] {
        const ELF_MACHINE: u32 = 243;
    } else {
        compile_error!("no ELF machine id for this architecture");
    }
}

pub struct JitDumpBackend;

impl Backend for JitDumpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::JitDump
    }

    fn code_padding(&self) -> usize {
        CODE_PADDING
    }

    fn init_state(&self) -> Result<Box<dyn BackendState>, Error> {
        Ok(Box::new(JitDumpState::open()?))
    }
}

struct JitDumpState {
    inner: Mutex<DumpFile>,
}

struct DumpFile {
    writer: BufWriter<File>,
    /// First page of the dump, mapped executable for the lifetime of the
    /// state. Unmapped on drop, after the file is flushed and closed.
    _marker: Mmap,
    next_code_id: u64,
}

impl JitDumpState {
    fn open() -> Result<JitDumpState, Error> {
        let path = dump_path(process_id());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(Error::BackendInit)?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_LEN, file);
        write_file_header(&mut writer).map_err(Error::BackendInit)?;
        writer.flush().map_err(Error::BackendInit)?;
        // Mapping must be executable; the profiler's mmap-event listener
        // filters for PROT_EXEC regions.
        let marker = unsafe { MmapOptions::new().len(page_size()).map_exec(writer.get_ref()) }
            .map_err(Error::BackendInit)?;
        Ok(JitDumpState {
            inner: Mutex::new(DumpFile {
                writer,
                _marker: marker,
                next_code_id: 0,
            }),
        })
    }
}

impl BackendState for JitDumpState {
    unsafe fn write_entry(
        &self,
        code_addr: *const u8,
        code_size: usize,
        symbol: &str,
    ) -> Result<(), Error> {
        let mut dump = self.inner.lock().unwrap();
        dump.write_unwinding_info(code_size)
            .map_err(Error::JitDumpWrite)?;
        let code = slice::from_raw_parts(code_addr, code_size);
        dump.write_code_load(code_addr as u64, code, symbol)
            .map_err(Error::JitDumpWrite)?;
        // Flush per record pair so a crash truncates the dump at a record
        // boundary.
        dump.writer.flush().map_err(Error::JitDumpWrite)
    }
}

impl DumpFile {
    fn write_unwinding_info(&mut self, code_size: usize) -> io::Result<()> {
        let eh = eh_frame::build(code_size);
        let unwind_data_size = eh.bytes.len();
        debug_assert!(unwind_data_size <= CODE_PADDING);

        let unpadded = BASE_EVENT_LEN + 3 * 8 + unwind_data_size + EH_FRAME_HEADER_LEN;
        let total = round_up(unpadded, 8);

        let w = &mut self.writer;
        w.write_u32::<LittleEndian>(JIT_CODE_UNWINDING_INFO)?;
        w.write_u32::<LittleEndian>(total as u32)?;
        w.write_u64::<LittleEndian>(monotonic_ns())?;
        w.write_u64::<LittleEndian>(unwind_data_size as u64)?;
        w.write_u64::<LittleEndian>(EH_FRAME_HEADER_LEN as u64)?;
        w.write_u64::<LittleEndian>(round_up(unwind_data_size, 16) as u64)?;
        w.write_all(&eh.bytes)?;
        w.write_all(&eh_frame::header_bytes(unwind_data_size, eh.cie_len, code_size))?;
        for _ in unpadded..total {
            w.write_u8(0)?;
        }
        Ok(())
    }

    fn write_code_load(&mut self, addr: u64, code: &[u8], symbol: &str) -> io::Result<()> {
        self.next_code_id += 1;
        let total = BASE_EVENT_LEN + 2 * 4 + 4 * 8 + symbol.len() + 1 + code.len();

        let w = &mut self.writer;
        w.write_u32::<LittleEndian>(JIT_CODE_LOAD)?;
        w.write_u32::<LittleEndian>(total as u32)?;
        w.write_u64::<LittleEndian>(monotonic_ns())?;
        w.write_u32::<LittleEndian>(process_id())?;
        w.write_u32::<LittleEndian>(thread_id())?;
        w.write_u64::<LittleEndian>(addr)?; // vma
        w.write_u64::<LittleEndian>(addr)?; // code address
        w.write_u64::<LittleEndian>(code.len() as u64)?;
        w.write_u64::<LittleEndian>(self.next_code_id)?;
        w.write_all(symbol.as_bytes())?;
        w.write_u8(0)?;
        w.write_all(code)?;
        Ok(())
    }
}

fn write_file_header<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_u32::<LittleEndian>(JITDUMP_MAGIC)?;
    w.write_u32::<LittleEndian>(JITDUMP_VERSION)?;
    w.write_u32::<LittleEndian>(FILE_HEADER_LEN)?;
    w.write_u32::<LittleEndian>(ELF_MACHINE)?;
    w.write_u32::<LittleEndian>(0)?; // reserved
    w.write_u32::<LittleEndian>(process_id())?;
    w.write_u64::<LittleEndian>(wall_clock_us())?;
    w.write_u64::<LittleEndian>(0)?; // flags
    Ok(())
}

pub(crate) fn dump_path(pid: u32) -> String {
    format!("/tmp/jit-{pid}.dump")
}

fn process_id() -> u32 {
    std::process::id()
}

#[cfg(target_os = "linux")]
fn thread_id() -> u32 {
    (unsafe { libc::gettid() }) as u32
}

#[cfg(not(target_os = "linux"))]
fn thread_id() -> u32 {
    process_id()
}

fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn wall_clock_us() -> u64 {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) };
    tv.tv_sec as u64 * 1_000_000 + tv.tv_usec as u64
}
