//! Simulated physical memory for host tests of code built on this crate.
//!
//! Physical addresses are byte offsets into a vector of 4 KiB frames.
//! Frame 0 exists but is never handed out, so a zero frame number in a
//! table entry always means a bug.

use crate::{FrameAlloc, PageEntryBits, PhysMapper};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use kernel_info::memory::KERNEL_HALF_FIRST_INDEX;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalFrame};

#[repr(align(4096))]
struct Frame4K([u8; PAGE_SIZE as usize]);

/// In-memory "RAM" with a direct-map style [`PhysMapper`].
pub struct TestPhys {
    frames: Box<[UnsafeCell<Frame4K>]>,
}

impl TestPhys {
    #[must_use]
    pub fn new(frame_count: usize) -> Self {
        let frames = (0..frame_count)
            .map(|_| UnsafeCell::new(Frame4K([0; PAGE_SIZE as usize])))
            .collect();
        Self { frames }
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Read the `u64` stored at `pa`.
    #[must_use]
    pub fn read_u64(&self, pa: PhysicalAddress) -> u64 {
        *unsafe { self.phys_to_mut::<u64>(pa) }
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let index = usize::try_from(pa.as_u64() / PAGE_SIZE).expect("frame index fits usize");
        let offset = pa.page_offset() as usize;
        assert!(index < self.frames.len(), "{pa:?} is outside simulated RAM");
        assert!(offset + size_of::<T>() <= PAGE_SIZE as usize, "{pa:?} crosses a frame");
        let base = self.frames[index].get().cast::<u8>();
        unsafe { &mut *base.add(offset).cast::<T>() }
    }
}

/// First-fit frame allocator over a [`TestPhys`] that tracks ownership and
/// panics on double free.
pub struct TestFrames {
    used: Vec<bool>,
}

impl TestFrames {
    #[must_use]
    pub fn new(phys: &TestPhys) -> Self {
        let mut used = vec![false; phys.frame_count()];
        if let Some(zero) = used.first_mut() {
            *zero = true;
        }
        Self { used }
    }

    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.used.iter().filter(|u| !**u).count() as u64
    }

    #[must_use]
    pub fn is_allocated(&self, frame: PhysicalFrame) -> bool {
        usize::try_from(frame.index())
            .ok()
            .and_then(|i| self.used.get(i).copied())
            .unwrap_or(true)
    }

    /// Allocate everything that is left and return it.
    pub fn take_all(&mut self) -> Vec<PhysicalFrame> {
        core::iter::from_fn(|| self.allocate_frame()).collect()
    }
}

impl FrameAlloc for TestFrames {
    fn allocate_frame(&mut self) -> Option<PhysicalFrame> {
        let index = self.used.iter().position(|u| !*u)?;
        self.used[index] = true;
        Some(PhysicalFrame::from_index(index as u64))
    }

    fn free_frame(&mut self, frame: PhysicalFrame) {
        let index = usize::try_from(frame.index()).expect("frame index fits usize");
        assert!(index != 0, "frame 0 is never allocated");
        let slot = self.used.get_mut(index).expect("freed frame outside simulated RAM");
        assert!(*slot, "double free of {frame:?}");
        *slot = false;
    }
}

/// Build a kernel root table whose kernel half holds one shared PDPT, the way
/// the boot tables look to every process.
///
/// Returns `(root, shared_pdpt)`.
pub fn kernel_root(phys: &TestPhys, frames: &mut TestFrames) -> (PhysicalFrame, PhysicalFrame) {
    let root = frames.allocate_frame().expect("frame for kernel root");
    let pdpt = frames.allocate_frame().expect("frame for kernel PDPT");
    phys.zero_frame(root);
    phys.zero_frame(pdpt);
    let table = unsafe { phys.table_mut(root) };
    let index = crate::TableIndex::new(KERNEL_HALF_FIRST_INDEX).expect("valid index");
    table[index] = PageEntryBits::next_table(pdpt).with_user_access(false);
    (root, pdpt)
}
