//! # Physical Frame Allocation
//!
//! Owns physical memory at 4 KiB granularity.
//!
//! ```text
//!   firmware memory map
//!           │ donate usable regions
//!           ▼
//!  ┌──────────────────────┐     ┌──────────────────────┐
//!  │  BitmapFrameAlloc    │     │   BuddyFrameAlloc    │
//!  │  one bit per frame   │     │  free list per order │
//!  └──────────┬───────────┘     └──────────┬───────────┘
//!             └──────────┬─────────────────┘
//!                        ▼
//!              LockedFrameAlloc<A>      (SpinLock, IRQs masked)
//!                        │  &LockedFrameAlloc: FrameAlloc
//!                        ▼
//!             kernel_vmem::AddressSpace
//! ```
//!
//! Both allocators start with every frame allocated and only hand out frames
//! that were explicitly donated, so anything the memory map does not report
//! as usable (including the allocator's own metadata) stays reserved.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod bitmap;
mod buddy;
mod locked;
pub mod phys_mapper;

pub use bitmap::BitmapFrameAlloc;
pub use buddy::{BuddyFrameAlloc, BuddyNode};
pub use locked::LockedFrameAlloc;
pub use phys_mapper::HhdmPhysMapper;

use kernel_memory_addresses::PhysicalFrame;
use kernel_vmem::FrameAlloc;

/// Allocation of physically contiguous frame runs.
pub trait ContiguousFrameAlloc: FrameAlloc {
    /// Allocate `count` contiguous frames, all or nothing.
    fn allocate_contiguous(&mut self, count: u64) -> Option<PhysicalFrame>;

    /// Free a run previously returned by
    /// [`ContiguousFrameAlloc::allocate_contiguous`].
    ///
    /// How strictly `count` is checked against the original allocation is up
    /// to the allocator: the bitmap frees each frame of the span that is
    /// still allocated, the buddy allocator requires the block's order.
    ///
    /// # Errors
    /// Rejects a zero count and spans that leave the managed range. The buddy
    /// allocator also rejects a `first` that is not an allocated block head
    /// and a `count` that rounds to a different order.
    fn free_contiguous(&mut self, first: PhysicalFrame, count: u64) -> Result<(), FrameAllocError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("{count} frame(s) at {first:?} are outside the managed range")]
    OutOfRange { first: PhysicalFrame, count: u64 },
    #[error("invalid frame count {0}")]
    InvalidCount(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryMapError {
    #[error("the memory map reports no usable memory")]
    NoUsableMemory,
    #[error("no usable region can hold the {bytes}-byte frame bitmap")]
    NoRoomForBitmap { bytes: u64 },
}
