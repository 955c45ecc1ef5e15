//! # Virtual Memory Support
//!
//! Four-level x86-64 page tables and the per-process [`AddressSpace`] built
//! on them.
//!
//! ## Layers
//!
//! - [`PageEntryBits`]: raw 64-bit entry, modeled with `bitfield-struct`.
//! - [`PageTable`] / [`TableIndex`]: a 4 KiB table of 512 entries, indexed by
//!   a bounds-checked 9-bit index extracted from a virtual address.
//! - [`MapFlags`]: the permission and cacheability bits a caller asks for.
//! - [`AddressSpace`]: create, map, unmap, duplicate, and destroy the user
//!   half of one page-table tree. The kernel half (PML4 entries 256..512) is
//!   copied from the kernel root on creation and never touched afterwards.
//!
//! ## Collaborators
//!
//! Physical frames come from a [`FrameAlloc`]; physical memory is reached
//! through a [`PhysMapper`] (the HHDM in the kernel, `TestPhys` in tests).
//!
//! ```text
//!  63        48 47     39 38     30 29     21 20     12 11        0
//! +------------+---------+---------+---------+---------+-----------+
//! |  sign ext  |  PML4   |  PDPT   |   PD    |   PT    |  offset   |
//! +------------+---------+---------+---------+---------+-----------+
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(any(test, feature = "test-support"))]
extern crate alloc;

mod address_space;
mod entry;
mod flags;
mod reservation;
mod table;
mod walk;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use address_space::AddressSpace;
pub use entry::PageEntryBits;
pub use flags::MapFlags;
pub use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalFrame, VirtualAddress, VirtualPage, align_down, align_up,
};
pub use table::{Level, PageTable, TableIndex, split_indices};

/// Source of physical 4 KiB frames.
///
/// Returned frames are **not** zeroed; callers that need zeroed memory clear
/// it through a [`PhysMapper`].
pub trait FrameAlloc {
    /// Allocate one frame, or `None` when physical memory is exhausted.
    fn allocate_frame(&mut self) -> Option<PhysicalFrame>;

    /// Return a frame previously obtained from [`FrameAlloc::allocate_frame`].
    fn free_frame(&mut self, frame: PhysicalFrame);
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    #[inline]
    fn allocate_frame(&mut self) -> Option<PhysicalFrame> {
        (**self).allocate_frame()
    }

    #[inline]
    fn free_frame(&mut self, frame: PhysicalFrame) {
        (**self).free_frame(frame);
    }
}

/// Converts physical addresses to usable references in the current virtual
/// address space (HHDM in the kernel, a simulated RAM buffer in tests).
pub trait PhysMapper {
    /// Convert a *physical* address to a mutable reference.
    ///
    /// # Safety
    /// - `pa` must be mapped and writable through this mapper.
    /// - `T` must match the bytes at `pa` and fit inside the frame.
    /// - The caller must not create aliasing mutable references.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// The page table stored in `frame`.
    ///
    /// # Safety
    /// As for [`PhysMapper::phys_to_mut`]; `frame` must hold a page table.
    #[inline]
    unsafe fn table_mut<'a>(&self, frame: PhysicalFrame) -> &'a mut PageTable {
        unsafe { self.phys_to_mut::<PageTable>(frame.base()) }
    }

    /// The raw bytes of `frame`.
    ///
    /// # Safety
    /// As for [`PhysMapper::phys_to_mut`].
    #[inline]
    unsafe fn frame_bytes_mut<'a>(&self, frame: PhysicalFrame) -> &'a mut [u8; PAGE_SIZE as usize] {
        unsafe { self.phys_to_mut::<[u8; PAGE_SIZE as usize]>(frame.base()) }
    }

    /// Fill `frame` with zeros.
    #[inline]
    fn zero_frame(&self, frame: PhysicalFrame) {
        unsafe { self.frame_bytes_mut(frame) }.fill(0);
    }

    /// Copy the contents of `src` into `dst`.
    #[inline]
    fn copy_frame(&self, src: PhysicalFrame, dst: PhysicalFrame) {
        debug_assert_ne!(src, dst);
        let src = unsafe { self.frame_bytes_mut(src) };
        let dst = unsafe { self.frame_bytes_mut(dst) };
        dst.copy_from_slice(src);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmemError {
    #[error("out of physical frames")]
    OutOfMemory,
    #[error("address {0:#x} is not 4 KiB aligned")]
    Unaligned(u64),
    #[error("mapping size must be non-zero, got {0:#x}")]
    InvalidSize(u64),
    #[error("range at {0} leaves the user half")]
    NotUserSpace(VirtualAddress),
    #[error("{0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("{0} is mapped read-only")]
    ReadOnly(VirtualAddress),
    #[error("{0} is covered by a huge page")]
    HugePage(VirtualAddress),
}
