//! Synthesized DWARF unwind info for the trampolines.
//!
//! Every jitdump unwinding-info record carries a tiny `.eh_frame` section:
//! one CIE describing the common frame rules and one FDE covering a single
//! trampoline, followed by an `.eh_frame_hdr` lookup table with exactly one
//! entry. The per-architecture FDE instruction sequences mirror the prologue
//! and epilogue of the assembly template byte for byte.

use std::mem;

use byteorder::{LittleEndian, WriteBytesExt};

const DW_CFA_NOP: u8 = 0x00;
const DW_CFA_DEF_CFA: u8 = 0x0c;
const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0e;
const DW_CFA_ADVANCE_LOC: u8 = 0x40;
const DW_CFA_OFFSET: u8 = 0x80;
#[allow(dead_code)]
const DW_CFA_RESTORE: u8 = 0xc0;

const DW_EH_PE_UDATA4: u8 = 0x03;
const DW_EH_PE_SDATA4: u8 = 0x0b;
const DW_EH_PE_PCREL: u8 = 0x10;
const DW_EH_PE_DATAREL: u8 = 0x30;

const CIE_VERSION: u8 = 1;

/// The FDE's initial location is pc-relative and points 0x30 bytes before the
/// trampoline, so the described range also covers the call site's prologue.
/// Retargeting to a different template requires recomputing this.
const FDE_INITIAL_LOC_OFFSET: i32 = -0x30;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        const REG_SP: u8 = 7;
        const REG_RA: u8 = 16;

        /// CFI deltas for the template: `push rbp` moves the CFA to sp+16,
        /// `pop rbp; ret` bring it back to sp+8.
        const FDE_PROGRAM: &[u8] = &[
            DW_CFA_ADVANCE_LOC | 4, DW_CFA_DEF_CFA_OFFSET, 16,
            DW_CFA_ADVANCE_LOC | 6, DW_CFA_DEF_CFA_OFFSET, 8,
        ];
    } else if #[cfg(target_arch = "aarch64")] {
        const REG_SP: u8 = 31;
        const REG_RA: u8 = 30;
        const REG_FP: u8 = 29;

        /// CFI deltas for the template: `stp x29, x30, [sp, #-16]!` saves the
        /// frame pointer and link register, `ldp` restores them.
        const FDE_PROGRAM: &[u8] = &[
            DW_CFA_ADVANCE_LOC | 1, DW_CFA_DEF_CFA_OFFSET, 16,
            DW_CFA_OFFSET | REG_FP, 2,
            DW_CFA_OFFSET | REG_RA, 1,
            DW_CFA_ADVANCE_LOC | 3,
            DW_CFA_RESTORE | REG_FP,
            DW_CFA_RESTORE | REG_RA,
            DW_CFA_DEF_CFA_OFFSET, 0,
        ];
    } else {
        compile_error!("no unwind tables for this architecture");
    }
}

/// One CIE plus one FDE, plus where the FDE starts.
pub(crate) struct EhFrame {
    pub bytes: Vec<u8>,
    pub cie_len: usize,
}

fn write_uleb128(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn write_sleb128(buf: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let sign_clear = byte & 0x40 == 0;
        if (value == 0 && sign_clear) || (value == -1 && !sign_clear) {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

/// Pad the current entry with `DW_CFA_nop` to the native word size, then
/// patch the entry's length field.
fn finish_entry(buf: &mut Vec<u8>, entry_start: usize) {
    while buf.len() % mem::size_of::<usize>() != 0 {
        buf.push(DW_CFA_NOP);
    }
    let length = (buf.len() - entry_start - 4) as u32;
    buf[entry_start..entry_start + 4].copy_from_slice(&length.to_le_bytes());
}

/// Build the `.eh_frame` bytes describing one trampoline of `code_size` bytes.
pub(crate) fn build(code_size: usize) -> EhFrame {
    let word = mem::size_of::<usize>();
    let mut buf = Vec::with_capacity(64);

    // CIE.
    let cie_start = buf.len();
    buf.extend_from_slice(&[0; 4]); // Length, patched below.
    buf.write_u32::<LittleEndian>(0).unwrap(); // CIE marker.
    buf.push(CIE_VERSION);
    buf.extend_from_slice(b"zR\0");
    write_uleb128(&mut buf, 1); // Code alignment factor.
    write_sleb128(&mut buf, -(word as i64)); // Data alignment factor.
    buf.push(REG_RA);
    write_uleb128(&mut buf, 1); // Augmentation data length.
    buf.push(DW_EH_PE_PCREL | DW_EH_PE_SDATA4);
    buf.push(DW_CFA_DEF_CFA);
    write_uleb128(&mut buf, REG_SP as u64);
    write_uleb128(&mut buf, word as u64);
    buf.push(DW_CFA_OFFSET | REG_RA);
    write_uleb128(&mut buf, 1);
    finish_entry(&mut buf, cie_start);
    let cie_len = buf.len();

    // FDE.
    let fde_start = buf.len();
    buf.extend_from_slice(&[0; 4]); // Length, patched below.
    // Distance from this field back to the start of the CIE.
    buf.write_u32::<LittleEndian>((fde_start + 4) as u32).unwrap();
    buf.write_i32::<LittleEndian>(FDE_INITIAL_LOC_OFFSET).unwrap();
    buf.write_u32::<LittleEndian>(code_size as u32).unwrap();
    buf.push(0); // Augmentation data length.
    buf.extend_from_slice(FDE_PROGRAM);
    finish_entry(&mut buf, fde_start);

    EhFrame { bytes: buf, cie_len }
}

/// Byte length of the serialized `.eh_frame_hdr`.
pub(crate) const EH_FRAME_HEADER_LEN: usize = 20;

/// Build the `.eh_frame_hdr` that follows the `.eh_frame` bytes in the
/// unwinding-info record. All displacements are negative: the header sits
/// after both the code and the frame section it describes.
pub(crate) fn header_bytes(
    eh_frame_len: usize,
    cie_len: usize,
    code_size: usize,
) -> [u8; EH_FRAME_HEADER_LEN] {
    let eh_frame_len = eh_frame_len as i32;
    let mut buf = Vec::with_capacity(EH_FRAME_HEADER_LEN);
    buf.push(1); // Version.
    buf.push(DW_EH_PE_PCREL | DW_EH_PE_SDATA4); // eh_frame_ptr encoding.
    buf.push(DW_EH_PE_UDATA4); // fde_count encoding.
    buf.push(DW_EH_PE_DATAREL | DW_EH_PE_SDATA4); // Table encoding.
    // Back from the eh_frame_ptr field to the start of .eh_frame.
    buf.write_i32::<LittleEndian>(-(eh_frame_len + 4)).unwrap();
    buf.write_i32::<LittleEndian>(1).unwrap(); // FDE count.
    // Table entry: initial code address, then its FDE address.
    let padded_code = round_up(code_size, 8) as i32;
    buf.write_i32::<LittleEndian>(-(padded_code + eh_frame_len))
        .unwrap();
    buf.write_i32::<LittleEndian>(-(eh_frame_len - cie_len as i32))
        .unwrap();
    buf.try_into().expect("header is exactly 20 bytes")
}

pub(crate) fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
