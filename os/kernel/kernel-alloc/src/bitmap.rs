use crate::{ContiguousFrameAlloc, FrameAllocError, MemoryMapError};
use kernel_info::boot::MemoryRegion;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalFrame, align_down, align_up};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, info, trace};

const BITS: u64 = u64::BITS as u64;

/// First-fit bitmap frame allocator: one bit per 4 KiB frame, set = allocated.
///
/// Starts with every frame allocated; only frames donated through
/// [`BitmapFrameAlloc::donate_region`] are ever handed out. Bits past
/// `total_frames` stay set forever.
pub struct BitmapFrameAlloc<'a> {
    bits: &'a mut [u64],
    total: u64,
    free: u64,
}

impl<'a> BitmapFrameAlloc<'a> {
    /// Manage frames `0..total_frames` with `storage` as the bitmap.
    ///
    /// `total_frames` is clamped to what `storage` can describe.
    pub fn new(storage: &'a mut [u64], total_frames: u64) -> Self {
        storage.fill(u64::MAX);
        let capacity = storage.len() as u64 * BITS;
        Self {
            bits: storage,
            total: total_frames.min(capacity),
            free: 0,
        }
    }

    /// Number of bitmap words needed for `total_frames` frames.
    #[must_use]
    pub const fn words_for(total_frames: u64) -> u64 {
        total_frames.div_ceil(BITS)
    }

    /// Build the allocator from a firmware memory map.
    ///
    /// The bitmap is placed in the first usable region with room for it and
    /// stays reserved, as does frame 0. Every other frame fully inside a
    /// usable region becomes free.
    ///
    /// # Errors
    /// [`MemoryMapError::NoUsableMemory`] if no region is usable;
    /// [`MemoryMapError::NoRoomForBitmap`] if none can hold the bitmap.
    ///
    /// # Safety
    /// `mapper` must map all of physical memory covered by usable regions,
    /// and nothing else may be using that memory for the lifetime `'a`.
    pub unsafe fn from_memory_map<M: PhysMapper>(
        regions: &[MemoryRegion],
        mapper: &M,
    ) -> Result<Self, MemoryMapError> {
        let end = regions
            .iter()
            .filter(|r| r.is_usable())
            .map(|r| align_down(r.end(), PAGE_SIZE))
            .max()
            .ok_or(MemoryMapError::NoUsableMemory)?;

        let total = end / PAGE_SIZE;
        let words = Self::words_for(total);
        let bytes = words * size_of::<u64>() as u64;
        let frames = bytes.div_ceil(PAGE_SIZE);

        let home = regions
            .iter()
            .filter(|r| r.is_usable())
            .find_map(|r| {
                let start = align_up(r.base.max(PAGE_SIZE), PAGE_SIZE);
                let stop = align_down(r.end(), PAGE_SIZE);
                (stop > start && (stop - start) / PAGE_SIZE >= frames).then_some(start)
            })
            .ok_or(MemoryMapError::NoRoomForBitmap { bytes })?;

        let words = usize::try_from(words).map_err(|_| MemoryMapError::NoRoomForBitmap { bytes })?;
        let storage = unsafe {
            let first: &mut u64 = mapper.phys_to_mut(PhysicalAddress::new(home));
            core::slice::from_raw_parts_mut(core::ptr::from_mut(first), words)
        };

        let mut alloc = Self::new(storage, total);
        for region in regions.iter().filter(|r| r.is_usable()) {
            alloc.donate_region(PhysicalAddress::new(region.base), region.length);
        }
        alloc.reserve_range(PhysicalFrame::containing(PhysicalAddress::new(home)), frames);

        info!(
            "frame bitmap at {home:#x} ({bytes} bytes): {} of {} frames free",
            alloc.free, alloc.total
        );
        Ok(alloc)
    }

    /// Mark every frame fully inside `[base, base + length)` free.
    /// Frame 0 is never donated. Returns the number of frames that became free.
    pub fn donate_region(&mut self, base: PhysicalAddress, length: u64) -> u64 {
        let start = align_up(base.as_u64(), PAGE_SIZE) / PAGE_SIZE;
        let end = align_down(base.as_u64().saturating_add(length), PAGE_SIZE) / PAGE_SIZE;
        let mut donated = 0;
        for index in start.max(1)..end.min(self.total) {
            if self.test(index) {
                self.clear(index);
                donated += 1;
            }
        }
        self.free += donated;
        debug!("donated {donated} frame(s) from {base}+{length:#x}");
        donated
    }

    /// Permanently mark `count` frames from `first` allocated.
    pub fn reserve_range(&mut self, first: PhysicalFrame, count: u64) {
        let start = first.index();
        for index in start..start.saturating_add(count).min(self.total) {
            if !self.test(index) {
                self.set(index);
                self.free -= 1;
            }
        }
    }

    /// Whether `frame` is allocated. Frames outside the managed range always
    /// report `true`.
    #[must_use]
    pub fn is_allocated(&self, frame: PhysicalFrame) -> bool {
        frame.index() >= self.total || self.test(frame.index())
    }

    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.free
    }

    #[must_use]
    pub const fn total_frames(&self) -> u64 {
        self.total
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn locate(index: u64) -> (usize, u64) {
        ((index / BITS) as usize, 1 << (index % BITS))
    }

    #[inline]
    fn test(&self, index: u64) -> bool {
        let (word, mask) = Self::locate(index);
        self.bits[word] & mask != 0
    }

    #[inline]
    fn set(&mut self, index: u64) {
        let (word, mask) = Self::locate(index);
        self.bits[word] |= mask;
    }

    #[inline]
    fn clear(&mut self, index: u64) {
        let (word, mask) = Self::locate(index);
        self.bits[word] &= !mask;
    }

    /// Start of the first run of `count` free frames.
    fn find_run(&self, count: u64) -> Option<u64> {
        let mut run_start = 0;
        let mut run_len = 0;
        let mut index = 0;
        while index < self.total {
            let (word, _) = Self::locate(index);
            if index % BITS == 0 && self.bits[word] == u64::MAX {
                run_len = 0;
                index += BITS;
                continue;
            }
            if self.test(index) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = index;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
            index += 1;
        }
        None
    }
}

impl FrameAlloc for BitmapFrameAlloc<'_> {
    fn allocate_frame(&mut self) -> Option<PhysicalFrame> {
        let (word, bits) = self
            .bits
            .iter()
            .enumerate()
            .find(|(_, bits)| **bits != u64::MAX)?;
        let index = word as u64 * BITS + u64::from((!*bits).trailing_zeros());
        if index >= self.total {
            return None;
        }
        self.set(index);
        self.free -= 1;
        trace!("allocated frame {index:#x}");
        Some(PhysicalFrame::from_index(index))
    }

    /// Double frees and frames outside the managed range are ignored.
    fn free_frame(&mut self, frame: PhysicalFrame) {
        let index = frame.index();
        if index >= self.total || !self.test(index) {
            debug!("ignoring free of unallocated frame {frame:?}");
            return;
        }
        self.clear(index);
        self.free += 1;
        trace!("freed frame {index:#x}");
    }
}

impl ContiguousFrameAlloc for BitmapFrameAlloc<'_> {
    fn allocate_contiguous(&mut self, count: u64) -> Option<PhysicalFrame> {
        if count == 0 || count > self.free {
            return None;
        }
        let start = self.find_run(count)?;
        for index in start..start + count {
            self.set(index);
        }
        self.free -= count;
        trace!("allocated {count} frame(s) at {start:#x}");
        Some(PhysicalFrame::from_index(start))
    }

    /// Frees of frames in the span that are already free are ignored.
    fn free_contiguous(&mut self, first: PhysicalFrame, count: u64) -> Result<(), FrameAllocError> {
        if count == 0 {
            return Err(FrameAllocError::InvalidCount(count));
        }
        let start = first.index();
        match start.checked_add(count) {
            Some(end) if end <= self.total => {}
            _ => return Err(FrameAllocError::OutOfRange { first, count }),
        }
        for index in start..start + count {
            self.free_frame(PhysicalFrame::from_index(index));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryRegionKind;
    use kernel_vmem::test_support::TestPhys;

    fn frame(i: u64) -> PhysicalFrame {
        PhysicalFrame::from_index(i)
    }

    fn with_alloc(total: u64, f: impl FnOnce(&mut BitmapFrameAlloc<'_>)) {
        let mut storage = vec![0u64; BitmapFrameAlloc::words_for(total) as usize];
        let mut alloc = BitmapFrameAlloc::new(&mut storage, total);
        alloc.donate_region(PhysicalAddress::zero(), total * PAGE_SIZE);
        f(&mut alloc);
    }

    #[test]
    fn starts_fully_allocated() {
        let mut storage = [0u64; 2];
        let mut alloc = BitmapFrameAlloc::new(&mut storage, 100);
        assert_eq!(alloc.free_frames(), 0);
        assert!(alloc.allocate_frame().is_none());
        assert!(alloc.is_allocated(frame(5)));
    }

    #[test]
    fn frame_zero_is_never_donated() {
        with_alloc(8, |alloc| {
            assert_eq!(alloc.free_frames(), 7);
            assert!(alloc.is_allocated(frame(0)));
            assert_eq!(alloc.allocate_frame(), Some(frame(1)));
        });
    }

    #[test]
    fn partial_pages_are_not_donated() {
        let mut storage = [0u64; 1];
        let mut alloc = BitmapFrameAlloc::new(&mut storage, 64);
        let donated = alloc.donate_region(PhysicalAddress::new(0x1800), 3 * PAGE_SIZE);
        // 0x1800..0x4800 fully covers frames 2 and 3 only
        assert_eq!(donated, 2);
        assert!(alloc.is_allocated(frame(1)));
        assert!(!alloc.is_allocated(frame(2)));
        assert!(alloc.is_allocated(frame(4)));
    }

    #[test]
    fn allocation_tracks_frees_exactly() {
        with_alloc(130, |alloc| {
            let frames: Vec<_> = core::iter::from_fn(|| alloc.allocate_frame()).collect();
            assert_eq!(frames.len(), 129);
            assert!(frames.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(alloc.free_frames(), 0);

            alloc.free_frame(frames[70]);
            alloc.free_frame(frames[3]);
            assert_eq!(alloc.free_frames(), 2);
            assert_eq!(alloc.allocate_frame(), Some(frames[3]));
            assert_eq!(alloc.allocate_frame(), Some(frames[70]));
        });
    }

    #[test]
    fn double_and_out_of_range_frees_are_ignored() {
        with_alloc(16, |alloc| {
            let f = alloc.allocate_frame().unwrap();
            alloc.free_frame(f);
            alloc.free_frame(f);
            alloc.free_frame(frame(1000));
            assert_eq!(alloc.free_frames(), 15);
            assert!(alloc.is_allocated(frame(1000)));
        });
    }

    #[test]
    fn contiguous_is_all_or_nothing() {
        with_alloc(64, |alloc| {
            // leave holes: 1..=63 free, then take every 4th frame
            let taken: Vec<_> = (1..64).step_by(4).map(frame).collect();
            for f in &taken {
                alloc.reserve_range(*f, 1);
            }
            let free_before = alloc.free_frames();
            assert!(alloc.allocate_contiguous(4).is_none());
            assert_eq!(alloc.free_frames(), free_before);

            let run = alloc.allocate_contiguous(3).unwrap();
            assert_eq!(run, frame(2));
            assert!((2..5).all(|i| alloc.is_allocated(frame(i))));
            assert_eq!(alloc.free_frames(), free_before - 3);
            assert!(alloc.allocate_contiguous(0).is_none());
        });
    }

    #[test]
    fn contiguous_run_crosses_word_boundary() {
        with_alloc(192, |alloc| {
            alloc.reserve_range(frame(1), 60);
            let run = alloc.allocate_contiguous(10).unwrap();
            assert_eq!(run, frame(61));
            alloc.free_contiguous(run, 10).unwrap();
            assert_eq!(alloc.free_frames(), 191 - 60);
        });
    }

    #[test]
    fn contiguous_free_skips_frames_already_free() {
        with_alloc(8, |alloc| {
            let run = alloc.allocate_contiguous(4).unwrap();
            alloc.free_frame(frame(run.index() + 1));
            assert_eq!(alloc.free_frames(), 4);

            alloc.free_contiguous(run, 4).unwrap();
            assert_eq!(alloc.free_frames(), 7);
            assert!((0..4).all(|i| !alloc.is_allocated(frame(run.index() + i))));
        });
    }

    #[test]
    fn contiguous_free_rejects_bad_span() {
        with_alloc(32, |alloc| {
            assert_eq!(
                alloc.free_contiguous(frame(30), 4),
                Err(FrameAllocError::OutOfRange { first: frame(30), count: 4 })
            );
            assert_eq!(alloc.free_contiguous(frame(3), 0), Err(FrameAllocError::InvalidCount(0)));
        });
    }

    #[test]
    fn bootstrap_from_memory_map() {
        let phys = TestPhys::new(64);
        let regions = [
            MemoryRegion::new(0, 0x1000, MemoryRegionKind::Reserved),
            MemoryRegion::usable(0x1000, 0x7000),
            MemoryRegion::new(0x8000, 0x8000, MemoryRegionKind::KernelAndModules),
            MemoryRegion::usable(0x10000, 0x30000),
        ];
        let alloc = unsafe { BitmapFrameAlloc::from_memory_map(&regions, &phys) }.unwrap();

        assert_eq!(alloc.total_frames(), 0x40);
        // frames 1..8 and 16..64, minus the bitmap's own frame
        assert_eq!(alloc.free_frames(), 7 + 48 - 1);
        assert!(alloc.is_allocated(frame(0)));
        assert!(alloc.is_allocated(frame(1)), "bitmap lives in the first usable frame");
        assert!(alloc.is_allocated(frame(8)));
        assert!(!alloc.is_allocated(frame(2)));
        assert!(!alloc.is_allocated(frame(16)));
    }

    #[test]
    fn bootstrap_needs_usable_memory() {
        let phys = TestPhys::new(4);
        let regions = [MemoryRegion::new(0, 0x4000, MemoryRegionKind::Reserved)];
        let result = unsafe { BitmapFrameAlloc::from_memory_map(&regions, &phys) };
        assert_eq!(result.err(), Some(MemoryMapError::NoUsableMemory));
    }
}
