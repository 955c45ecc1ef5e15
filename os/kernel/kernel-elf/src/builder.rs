//! In-memory ELF64 executables for tests.

use crate::SegmentFlags;
use crate::header::{EHDR_SIZE, EM_X86_64, ET_EXEC, PHDR_SIZE, PT_LOAD};
use alloc::vec::Vec;

struct Segment {
    vaddr: u64,
    data: Vec<u8>,
    mem_size: u64,
    flags: SegmentFlags,
}

/// Builds a minimal little-endian x86-64 `ET_EXEC` image: header, program
/// headers, then each segment's file bytes back to back.
pub struct ElfBuilder {
    entry: u64,
    segments: Vec<Segment>,
}

impl ElfBuilder {
    #[must_use]
    pub const fn new(entry: u64) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    /// Add a `PT_LOAD` segment with `data` as its file content.
    #[must_use]
    pub fn segment(mut self, vaddr: u64, data: &[u8], mem_size: u64, flags: SegmentFlags) -> Self {
        self.segments.push(Segment {
            vaddr,
            data: data.to_vec(),
            mem_size,
            flags,
        });
        self
    }

    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let phnum = self.segments.len();
        let mut out = Vec::new();

        out.extend_from_slice(b"\x7FELF");
        out.extend_from_slice(&[2, 1, 1, 0]);
        out.resize(16, 0);
        out.extend_from_slice(&ET_EXEC.to_le_bytes());
        out.extend_from_slice(&EM_X86_64.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(phnum as u16).to_le_bytes());
        out.extend_from_slice(&[0; 6]);
        debug_assert_eq!(out.len(), EHDR_SIZE);

        let mut offset = (EHDR_SIZE + phnum * PHDR_SIZE) as u64;
        for seg in &self.segments {
            out.extend_from_slice(&PT_LOAD.to_le_bytes());
            out.extend_from_slice(&seg.flags.into_bits().to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&(seg.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&seg.mem_size.to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes());
            offset += seg.data.len() as u64;
        }
        for seg in &self.segments {
            out.extend_from_slice(&seg.data);
        }
        out
    }
}
