//! # ELF64 Images
//!
//! [`ElfView`] validates an x86-64 executable in place and iterates its
//! program headers without allocating; [`load`] materializes the `PT_LOAD`
//! segments into a user [`AddressSpace`](kernel_vmem::AddressSpace).

#![cfg_attr(not(any(test, doctest)), no_std)]

#[cfg(any(test, feature = "test-support"))]
extern crate alloc;

#[cfg(any(test, feature = "test-support"))]
pub mod builder;
mod header;
mod load;

pub use header::{ElfView, ProgramHeader, SegmentFlags, elf64_view};
pub use load::{LoadError, LoadedImage, load};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ElfError {
    #[error("image is shorter than the ELF header")]
    TooShort,
    #[error("missing \\x7fELF magic")]
    BadMagic,
    #[error("not a 64-bit image")]
    BadClass,
    #[error("not a little-endian image")]
    BadEndianness,
    #[error("unsupported ELF version")]
    BadVersion,
    #[error("not an executable image (e_type {0})")]
    BadType(u16),
    #[error("not an x86-64 image (e_machine {0})")]
    BadMachine(u16),
    #[error("unexpected program header size {0}")]
    BadPhEntSize(u16),
    #[error("header or segment reaches past the end of the image")]
    OutOfBounds,
    #[error("segment at {0:#x} has mem_size smaller than file_size")]
    BadSegment(u64),
    #[error("image has no loadable segment")]
    NoLoadSegments,
}
