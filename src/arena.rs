//! Executable code arenas.
//!
//! An arena is a 16-page anonymous mapping prepopulated with copies of the
//! assembly template, one per 16-byte-aligned chunk, and then flipped from
//! read-write to read-execute. Minting a trampoline is a bump-pointer
//! allocation; a fresh arena is mapped whenever the current one runs out.

use memmap2::{Mmap, MmapOptions};

use crate::error::Error;
use crate::template;

const ARENA_PAGES: usize = 16;

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A freshly minted trampoline: one template copy inside some arena.
#[derive(Clone, Copy)]
pub(crate) struct Trampoline {
    pub ptr: *const u8,
    /// Length of the executable stub, excluding the chunk's padding.
    pub code_size: usize,
}

pub(crate) struct CodeArena {
    map: Mmap,
    used: usize,
    chunk_size: usize,
    template_len: usize,
}

impl CodeArena {
    /// Map a new arena and prepopulate it with template copies.
    ///
    /// `code_padding` is the active backend's per-trampoline padding request;
    /// it is folded into this arena's chunk size for good, so arenas created
    /// under different backends stay internally consistent.
    fn new(code_padding: usize) -> Result<CodeArena, Error> {
        let size = ARENA_PAGES * page_size();
        let mut map = MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(Error::AllocationFailure)?;

        let template = template::template_bytes();
        let chunk_size = round_up(template.len() + code_padding, 16);
        let mut offset = 0;
        while offset + chunk_size <= size {
            map[offset..offset + template.len()].copy_from_slice(template);
            offset += chunk_size;
        }

        let map = map.make_exec().map_err(Error::AllocationFailure)?;
        template::flush_instruction_cache(map.as_ptr(), size);

        Ok(CodeArena {
            map,
            used: 0,
            chunk_size,
            template_len: template.len(),
        })
    }

    fn remaining(&self) -> usize {
        self.map.len() - self.used
    }

    fn has_room(&self) -> bool {
        self.remaining() >= self.chunk_size
    }

    /// Hand out the next chunk. Caller must have checked `has_room`.
    fn bump(&mut self) -> Trampoline {
        debug_assert!(self.has_room());
        let ptr = unsafe { self.map.as_ptr().add(self.used) };
        self.used += self.chunk_size;
        Trampoline {
            ptr,
            code_size: self.template_len,
        }
    }

    fn info(&self) -> ArenaInfo {
        ArenaInfo {
            base: self.map.as_ptr() as usize,
            size: self.map.len(),
            chunk_size: self.chunk_size,
            template_len: self.template_len,
            used: self.used,
            remaining: self.remaining(),
        }
    }
}

/// All live arenas, newest last.
pub(crate) struct ArenaList {
    arenas: Vec<CodeArena>,
}

impl ArenaList {
    pub const fn new() -> ArenaList {
        ArenaList { arenas: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.arenas.is_empty()
    }

    /// Map one more arena.
    pub fn grow(&mut self, code_padding: usize) -> Result<(), Error> {
        self.arenas.push(CodeArena::new(code_padding)?);
        Ok(())
    }

    /// Mint a trampoline, growing the list if the current arena is full.
    pub fn mint(&mut self, code_padding: usize) -> Result<Trampoline, Error> {
        match self.arenas.last() {
            Some(arena) if arena.has_room() => {}
            _ => self.grow(code_padding)?,
        }
        let arena = self
            .arenas
            .last_mut()
            .expect("grow() just ensured a non-empty arena list");
        Ok(arena.bump())
    }

    /// Unmap every arena, newest first.
    pub fn release(&mut self) {
        while self.arenas.pop().is_some() {}
    }

    pub fn stats(&self) -> Vec<ArenaInfo> {
        self.arenas.iter().map(CodeArena::info).collect()
    }
}

/// Geometry of one live arena, as reported by [`arena_stats`](crate::arena_stats).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaInfo {
    /// Base address of the mapping.
    pub base: usize,
    /// Total mapping size in bytes.
    pub size: usize,
    /// Byte distance between consecutive trampolines.
    pub chunk_size: usize,
    /// Length of the template copy at the start of each chunk.
    pub template_len: usize,
    /// Bytes handed out so far.
    pub used: usize,
    /// Bytes still available.
    pub remaining: usize,
}

impl ArenaInfo {
    /// Whether `addr` lies inside this arena's mapping.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}
