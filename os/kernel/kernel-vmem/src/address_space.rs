use crate::reservation::FrameReservation;
use crate::table::{Level, PageTable, split_indices};
use crate::walk::{UserWalk, WalkEvent};
use crate::{FrameAlloc, MapFlags, PageEntryBits, PhysMapper, VmemError};
use kernel_info::memory::USER_SPACE_END;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalFrame, VirtualAddress};
use kernel_registers::Cr3;
use log::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// One page-table tree: the kernel half shared with every other space, the
/// user half private.
///
/// Every present user-half leaf frame and every user-half table frame is
/// owned by the address space and released by [`AddressSpace::destroy`].
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalFrame,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// View an existing tree rooted at `root`.
    pub const fn from_root(mapper: &'m M, root: PhysicalFrame) -> Self {
        Self { root, mapper }
    }

    /// Allocate a new root table: user half zeroed, kernel half copied from
    /// `kernel_root`.
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`] if no frame is free for the root. The
    /// allocator is left untouched in that case.
    pub fn create<A: FrameAlloc>(
        mapper: &'m M,
        alloc: &mut A,
        kernel_root: PhysicalFrame,
    ) -> Result<Self, VmemError> {
        let root = alloc.allocate_frame().ok_or(VmemError::OutOfMemory)?;
        let table = unsafe { mapper.table_mut(root) };
        let kernel = unsafe { mapper.table_mut(kernel_root) };
        table.clear_user_half();
        table.copy_kernel_half(kernel);
        trace!("created address space with root {root:?}");
        Ok(Self { root, mapper })
    }

    #[must_use]
    pub const fn root(&self) -> PhysicalFrame {
        self.root
    }

    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[allow(clippy::mut_from_ref)]
    fn table(&self, frame: PhysicalFrame) -> &mut PageTable {
        unsafe { self.mapper.table_mut(frame) }
    }

    /// Map `size` bytes (rounded up to whole pages) at `va`.
    ///
    /// With `pa == Some(..)` the range maps that physical range 1:1; with
    /// `None` a fresh zeroed frame is allocated per page. Missing intermediate
    /// tables are created on the way.
    ///
    /// The call is all-or-nothing: every page is checked for an existing
    /// mapping, and every frame the call needs (pages and tables) is reserved
    /// before the first entry is written.
    ///
    /// # Errors
    /// - [`VmemError::Unaligned`] if `va` or `pa` is not page-aligned.
    /// - [`VmemError::InvalidSize`] if `size` is zero.
    /// - [`VmemError::NotUserSpace`] if the range reaches the kernel half.
    /// - [`VmemError::AlreadyMapped`] if any page already has a leaf.
    /// - [`VmemError::OutOfMemory`] if the reservation cannot be satisfied.
    pub fn map<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: Option<PhysicalAddress>,
        size: u64,
        flags: MapFlags,
    ) -> Result<(), VmemError> {
        let pages = Self::check_range(va, size)?;
        if let Some(pa) = pa
            && !pa.is_page_aligned()
        {
            return Err(VmemError::Unaligned(pa.as_u64()));
        }

        for page in Self::pages(va, pages) {
            if self.is_mapped(page) {
                debug!("refusing to map {page}: already present");
                return Err(VmemError::AlreadyMapped(page));
            }
        }

        let tables = self.missing_tables(va, pages);
        let data = if pa.is_some() { 0 } else { pages };
        let mut reserve = FrameReservation::new(self.mapper);
        if !reserve.fill(alloc, tables + data) {
            warn!("cannot map {pages} page(s) at {va}: {tables} table and {data} data frame(s) unavailable");
            return Err(VmemError::OutOfMemory);
        }

        for (i, page) in Self::pages(va, pages).enumerate() {
            let frame = match pa {
                Some(pa) => (pa + i as u64 * PAGE_SIZE).frame(),
                None => {
                    let frame = reserve.take().ok_or(VmemError::OutOfMemory)?;
                    self.mapper.zero_frame(frame);
                    frame
                }
            };
            let pt = self.walk_create(page, &mut reserve)?;
            let [.., l1] = split_indices(page);
            pt[l1] = flags.leaf_entry(frame);
        }

        debug_assert_eq!(reserve.len(), 0);
        trace!("mapped {pages} page(s) at {va}");
        Ok(())
    }

    /// Remove `size` bytes of mappings at `va`, releasing the leaf frames.
    ///
    /// Intermediate tables stay in place until [`AddressSpace::destroy`].
    ///
    /// # Errors
    /// Range errors as for [`AddressSpace::map`]; [`VmemError::NotMapped`] if
    /// any page in the range has no 4 KiB leaf. Nothing is changed on error.
    pub fn unmap<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        size: u64,
    ) -> Result<(), VmemError> {
        let pages = Self::check_range(va, size)?;
        for page in Self::pages(va, pages) {
            match self.leaf_with_level(page) {
                Some((_, Level::Pt)) => {}
                Some(_) => return Err(VmemError::HugePage(page)),
                None => return Err(VmemError::NotMapped(page)),
            }
        }

        for page in Self::pages(va, pages) {
            if let Some(pt) = self.walk(page) {
                let [.., l1] = split_indices(page);
                let frame = pt[l1].frame();
                pt[l1] = PageEntryBits::new();
                flush_page(page);
                alloc.free_frame(frame);
            }
        }
        trace!("unmapped {pages} page(s) at {va}");
        Ok(())
    }

    /// The leaf entry translating `va`, if any.
    #[must_use]
    pub fn leaf(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        self.leaf_with_level(va).map(|(entry, _)| entry)
    }

    fn leaf_with_level(&self, va: VirtualAddress) -> Option<(PageEntryBits, Level)> {
        let [l4, l3, l2, l1] = split_indices(va);
        let mut table = self.table(self.root);
        for (index, level) in [(l4, Level::Pml4), (l3, Level::Pdpt), (l2, Level::Pd)] {
            let entry = table[index];
            if !entry.present() {
                return None;
            }
            if entry.large_page() && level != Level::Pml4 {
                return Some((entry, level));
            }
            table = self.table(entry.frame());
        }
        let entry = table[l1];
        entry.present().then_some((entry, Level::Pt))
    }

    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.leaf(va).is_some()
    }

    /// Translate `va` to the physical address it maps to.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (entry, level) = self.leaf_with_level(va)?;
        let offset = va.as_u64() & (level.entry_span() - 1);
        Some(entry.frame().base() + offset)
    }

    /// The leaf page table covering `va`, without creating anything.
    #[allow(clippy::mut_from_ref)]
    fn walk(&self, va: VirtualAddress) -> Option<&mut PageTable> {
        let [l4, l3, l2, _] = split_indices(va);
        let mut table = self.table(self.root);
        for index in [l4, l3, l2] {
            let entry = table[index];
            if !entry.present() || entry.large_page() {
                return None;
            }
            table = self.table(entry.frame());
        }
        Some(table)
    }

    /// The leaf page table covering `va`, creating missing tables from
    /// `reserve`.
    #[allow(clippy::mut_from_ref)]
    fn walk_create(
        &self,
        va: VirtualAddress,
        reserve: &mut FrameReservation<'m, M>,
    ) -> Result<&mut PageTable, VmemError> {
        let [l4, l3, l2, _] = split_indices(va);
        let mut table = self.table(self.root);
        for index in [l4, l3, l2] {
            let mut entry = table[index];
            if !entry.present() {
                let frame = reserve.take().ok_or(VmemError::OutOfMemory)?;
                self.mapper.zero_frame(frame);
                entry = PageEntryBits::next_table(frame);
                table[index] = entry;
            } else if entry.large_page() {
                return Err(VmemError::HugePage(va));
            }
            table = self.table(entry.frame());
        }
        Ok(table)
    }

    /// How many of PDPT/PD/PT along the path to `va` are absent (`0..=3`).
    fn missing_depth(&self, va: VirtualAddress) -> u8 {
        let [l4, l3, l2, _] = split_indices(va);
        let mut table = self.table(self.root);
        for (missing, index) in [(3, l4), (2, l3), (1, l2)] {
            let entry = table[index];
            if !entry.present() {
                return missing;
            }
            table = self.table(entry.frame());
        }
        0
    }

    /// Exact number of table frames mapping `pages` pages at `va` will create.
    fn missing_tables(&self, va: VirtualAddress, pages: u64) -> u64 {
        let mut needed = 0;
        let mut counted: [Option<u64>; 3] = [None; 3];
        for page in Self::pages(va, pages) {
            let depth = self.missing_depth(page);
            for (slot, (min_depth, level)) in
                [(3, Level::Pml4), (2, Level::Pdpt), (1, Level::Pd)].into_iter().enumerate()
            {
                // A table created below `level` is shared by every page with
                // the same address bits above `level.shift()`.
                let key = page.as_u64() >> level.shift();
                if depth >= min_depth && counted[slot] != Some(key) {
                    counted[slot] = Some(key);
                    needed += 1;
                }
            }
        }
        needed
    }

    fn check_range(va: VirtualAddress, size: u64) -> Result<u64, VmemError> {
        if !va.is_page_aligned() {
            return Err(VmemError::Unaligned(va.as_u64()));
        }
        if size == 0 {
            return Err(VmemError::InvalidSize(size));
        }
        let pages = size.div_ceil(PAGE_SIZE);
        let end = pages
            .checked_mul(PAGE_SIZE)
            .and_then(|len| va.as_u64().checked_add(len));
        match end {
            Some(end) if end <= USER_SPACE_END => Ok(pages),
            _ => Err(VmemError::NotUserSpace(va)),
        }
    }

    fn pages(va: VirtualAddress, count: u64) -> impl Iterator<Item = VirtualAddress> {
        (0..count).map(move |i| va + i * PAGE_SIZE)
    }

    /// Copy `buf.len()` bytes starting at user address `va` into `buf`.
    ///
    /// # Errors
    /// [`VmemError::NotMapped`] if any touched page is absent or not
    /// user-accessible. Nothing is copied in that case.
    pub fn read_bytes(&self, va: VirtualAddress, buf: &mut [u8]) -> Result<(), VmemError> {
        self.for_each_chunk(va, buf.len(), Access::Read, |frame_bytes, _, done| {
            let n = frame_bytes.len();
            buf[done..done + n].copy_from_slice(frame_bytes);
        })
    }

    /// Copy `data` into user memory starting at `va`.
    ///
    /// # Errors
    /// As for [`AddressSpace::read_bytes`], plus [`VmemError::ReadOnly`] if
    /// a touched page is not writable.
    pub fn write_bytes(&self, va: VirtualAddress, data: &[u8]) -> Result<(), VmemError> {
        self.for_each_chunk(va, data.len(), Access::Write, |frame_bytes, _, done| {
            let n = frame_bytes.len();
            frame_bytes.copy_from_slice(&data[done..done + n]);
        })
    }

    /// Fill `len` bytes of user memory at `va` with `byte`.
    ///
    /// # Errors
    /// As for [`AddressSpace::write_bytes`].
    pub fn fill(&self, va: VirtualAddress, len: usize, byte: u8) -> Result<(), VmemError> {
        self.for_each_chunk(va, len, Access::Write, |frame_bytes, _, _| frame_bytes.fill(byte))
    }

    /// Visit `[va, va + len)` page by page as slices of physical memory.
    ///
    /// `f` gets the slice, its offset in the page, and the number of bytes
    /// already visited. All pages are resolved and checked against `access`
    /// before `f` first runs.
    fn for_each_chunk(
        &self,
        va: VirtualAddress,
        len: usize,
        access: Access,
        mut f: impl FnMut(&mut [u8], usize, usize),
    ) -> Result<(), VmemError> {
        if len == 0 {
            return Ok(());
        }
        let end = va
            .checked_add(len as u64)
            .filter(|end| end.as_u64() <= USER_SPACE_END)
            .ok_or(VmemError::NotUserSpace(va))?;

        let first = va.page().base();
        let mut page = first;
        while page < end {
            match self.leaf(page) {
                Some(entry) if !entry.user_access() => return Err(VmemError::NotMapped(page)),
                Some(entry) if access == Access::Write && !entry.writable() => {
                    return Err(VmemError::ReadOnly(page));
                }
                Some(_) => {}
                None => return Err(VmemError::NotMapped(page)),
            }
            page += PAGE_SIZE;
        }

        let mut cursor = va;
        let mut done = 0;
        while cursor < end {
            let pa = self.translate(cursor).ok_or(VmemError::NotMapped(cursor))?;
            let offset = cursor.page_offset() as usize;
            let n = (PAGE_SIZE as usize - offset).min(len - done);
            let bytes = unsafe { self.mapper.frame_bytes_mut(pa.frame()) };
            f(&mut bytes[offset..offset + n], offset, done);
            done += n;
            cursor += n as u64;
        }
        Ok(())
    }

    /// Deep-copy this address space: a new root with the same kernel half,
    /// and every present user leaf copied into a newly allocated frame with
    /// identical flags.
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`] if any frame cannot be allocated; the
    /// partial copy is destroyed before returning. [`VmemError::HugePage`] if
    /// the user half contains a huge page.
    pub fn duplicate<A: FrameAlloc>(&self, alloc: &mut A) -> Result<Self, VmemError> {
        let child = Self::create(self.mapper, alloc, self.root)?;
        let mut copied = 0usize;
        for event in UserWalk::new(self.mapper, self.root) {
            let WalkEvent::Leaf { va, entry, level } = event else {
                continue;
            };
            let result = if level == Level::Pt {
                child.copy_leaf(alloc, va, entry)
            } else {
                Err(VmemError::HugePage(va))
            };
            if let Err(e) = result {
                warn!("address space copy failed after {copied} page(s): {e}");
                child.destroy(alloc);
                return Err(e);
            }
            copied += 1;
        }
        debug!("duplicated {copied} user page(s) into {:?}", child.root);
        Ok(child)
    }

    fn copy_leaf<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        entry: PageEntryBits,
    ) -> Result<(), VmemError> {
        let frame = alloc.allocate_frame().ok_or(VmemError::OutOfMemory)?;
        self.mapper.copy_frame(entry.frame(), frame);
        self.map(
            alloc,
            va,
            Some(frame.base()),
            PAGE_SIZE,
            MapFlags::from_entry(entry),
        )
        .inspect_err(|_| alloc.free_frame(frame))
    }

    /// Release every user leaf frame, every user-half table, and the root.
    /// The kernel half is shared and left alone.
    pub fn destroy<A: FrameAlloc>(self, alloc: &mut A) {
        let mut frames = 0usize;
        for event in UserWalk::new(self.mapper, self.root) {
            let frame = match event {
                WalkEvent::Leaf { entry, .. } => entry.frame(),
                WalkEvent::TableDone { table, .. } => table,
            };
            alloc.free_frame(frame);
            frames += 1;
        }
        trace!("destroyed address space {:?}, released {frames} frame(s)", self.root);
    }

    /// Number of present user-half leaves.
    #[must_use]
    pub fn user_page_count(&self) -> usize {
        UserWalk::new(self.mapper, self.root)
            .filter(|e| matches!(e, WalkEvent::Leaf { .. }))
            .count()
    }

    /// Load this tree into `CR3`.
    ///
    /// # Safety
    /// Ring 0 only. The kernel half must map the currently executing code and
    /// stack.
    pub unsafe fn activate(&self) {
        use kernel_registers::StoreRegisterUnsafe;
        unsafe { Cr3::from_pml4(self.root).store_unsafe() };
    }
}

#[inline]
fn flush_page(va: VirtualAddress) {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    let _ = va;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TableIndex;
    use crate::test_support::{TestFrames, TestPhys, kernel_root};

    const VA: VirtualAddress = VirtualAddress::new(0x40_0000);

    fn setup(frames: usize) -> (TestPhys, TestFrames) {
        let phys = TestPhys::new(frames);
        let alloc = TestFrames::new(&phys);
        (phys, alloc)
    }

    #[test]
    fn create_shares_kernel_half_only() {
        let (phys, mut alloc) = setup(16);
        let (kroot, kpdpt) = kernel_root(&phys, &mut alloc);
        let space = AddressSpace::create(&phys, &mut alloc, kroot).unwrap();

        let table = unsafe { phys.table_mut(space.root()) };
        let kernel_slot = TableIndex::new(256).unwrap();
        assert_eq!(table[kernel_slot].frame(), kpdpt);
        assert!((0..256).all(|i| table[TableIndex::new(i).unwrap()].is_unused()));
        assert_eq!(space.user_page_count(), 0);
    }

    #[test]
    fn create_without_memory_changes_nothing() {
        let (phys, mut alloc) = setup(4);
        let (kroot, _) = kernel_root(&phys, &mut alloc);
        let hoard = alloc.take_all();
        assert!(!hoard.is_empty());

        let result = AddressSpace::create(&phys, &mut alloc, kroot);
        assert_eq!(result.err(), Some(VmemError::OutOfMemory));
        assert_eq!(alloc.free_count(), 0);
    }

    #[test]
    fn map_one_page_creates_tables_and_leaf() {
        let (phys, mut alloc) = setup(32);
        let (kroot, _) = kernel_root(&phys, &mut alloc);
        let space = AddressSpace::create(&phys, &mut alloc, kroot).unwrap();
        let before = alloc.free_count();

        let flags = MapFlags::user_rw().with_no_execute(true);
        space.map(&mut alloc, VA, None, PAGE_SIZE, flags).unwrap();

        // PDPT + PD + PT + data page
        assert_eq!(before - alloc.free_count(), 4);
        let leaf = space.leaf(VA).unwrap();
        assert_eq!(MapFlags::from_entry(leaf), flags);
        assert!(space.translate(VA + 0x123).is_some());
        assert_eq!(space.translate(VA + 0x123).unwrap().page_offset(), 0x123);
        assert!(space.leaf(VA + PAGE_SIZE).is_none());
    }

    #[test]
    fn map_fixed_physical_range() {
        let (phys, mut alloc) = setup(32);
        let (kroot, _) = kernel_root(&phys, &mut alloc);
        let space = AddressSpace::create(&phys, &mut alloc, kroot).unwrap();

        let pa = PhysicalAddress::new(0x1_0000);
        space
            .map(&mut alloc, VA, Some(pa), 2 * PAGE_SIZE, MapFlags::user_rw())
            .unwrap();
        assert_eq!(space.translate(VA), Some(pa));
        assert_eq!(space.translate(VA + PAGE_SIZE + 8), Some(pa + PAGE_SIZE + 8));
    }

    #[test]
    fn partial_size_rounds_up_to_pages() {
        let (phys, mut alloc) = setup(32);
        let (kroot, _) = kernel_root(&phys, &mut alloc);
        let space = AddressSpace::create(&phys, &mut alloc, kroot).unwrap();

        space.map(&mut alloc, VA, None, PAGE_SIZE + 1, MapFlags::user_rw()).unwrap();
        assert_eq!(space.user_page_count(), 2);
    }

    #[test]
    fn rejects_bad_arguments() {
        let (phys, mut alloc) = setup(32);
        let (kroot, _) = kernel_root(&phys, &mut alloc);
        let space = AddressSpace::create(&phys, &mut alloc, kroot).unwrap();
        let before = alloc.free_count();
        let flags = MapFlags::user_rw();

        assert_eq!(
            space.map(&mut alloc, VA + 1, None, PAGE_SIZE, flags),
            Err(VmemError::Unaligned(VA.as_u64() + 1))
        );
        assert_eq!(
            space.map(&mut alloc, VA, Some(PhysicalAddress::new(0x1001)), PAGE_SIZE, flags),
            Err(VmemError::Unaligned(0x1001))
        );
        assert_eq!(
            space.map(&mut alloc, VA, None, 0, flags),
            Err(VmemError::InvalidSize(0))
        );
        let top = VirtualAddress::new(USER_SPACE_END - PAGE_SIZE);
        assert_eq!(
            space.map(&mut alloc, top, None, 2 * PAGE_SIZE, flags),
            Err(VmemError::NotUserSpace(top))
        );
        assert_eq!(alloc.free_count(), before);
    }

    #[test]
    fn already_mapped_has_no_side_effects() {
        let (phys, mut alloc) = setup(32);
        let (kroot, _) = kernel_root(&phys, &mut alloc);
        let space = AddressSpace::create(&phys, &mut alloc, kroot).unwrap();
        let second = VA + PAGE_SIZE;
        space.map(&mut alloc, second, None, PAGE_SIZE, MapFlags::user_rw()).unwrap();
        let before = alloc.free_count();

        let result = space.map(&mut alloc, VA, None, 3 * PAGE_SIZE, MapFlags::user_rw());
        assert_eq!(result, Err(VmemError::AlreadyMapped(second)));
        assert_eq!(alloc.free_count(), before);
        assert!(space.leaf(VA).is_none());
    }

    #[test]
    fn out_of_memory_rolls_back() {
        let (phys, mut alloc) = setup(12);
        let (kroot, _) = kernel_root(&phys, &mut alloc);
        let space = AddressSpace::create(&phys, &mut alloc, kroot).unwrap();
        let before = alloc.free_count();

        // three tables plus one frame per page cannot fit
        let pages = before;
        let result = space.map(&mut alloc, VA, None, pages * PAGE_SIZE, MapFlags::user_rw());
        assert_eq!(result, Err(VmemError::OutOfMemory));
        assert_eq!(alloc.free_count(), before);
        assert_eq!(space.user_page_count(), 0);
        let root = unsafe { phys.table_mut(space.root()) };
        assert!((0..256).all(|i| root[TableIndex::new(i).unwrap()].is_unused()));
    }

    #[test]
    fn table_count_spans_boundaries() {
        let (phys, mut alloc) = setup(64);
        let (kroot, _) = kernel_root(&phys, &mut alloc);
        let space = AddressSpace::create(&phys, &mut alloc, kroot).unwrap();
        let before = alloc.free_count();

        // two pages straddling a 2 MiB boundary need two page tables
        let va = VirtualAddress::new(0x20_0000 - PAGE_SIZE);
        space.map(&mut alloc, va, None, 2 * PAGE_SIZE, MapFlags::user_rw()).unwrap();
        assert_eq!(before - alloc.free_count(), 1 + 1 + 2 + 2);
    }

    #[test]
    fn unmap_releases_leaf_frames() {
        let (phys, mut alloc) = setup(32);
        let (kroot, _) = kernel_root(&phys, &mut alloc);
        let space = AddressSpace::create(&phys, &mut alloc, kroot).unwrap();
        space.map(&mut alloc, VA, None, 2 * PAGE_SIZE, MapFlags::user_rw()).unwrap();
        let before = alloc.free_count();

        assert_eq!(
            space.unmap(&mut alloc, VA, 3 * PAGE_SIZE),
            Err(VmemError::NotMapped(VA + 2 * PAGE_SIZE))
        );
        assert_eq!(alloc.free_count(), before);

        space.unmap(&mut alloc, VA, 2 * PAGE_SIZE).unwrap();
        assert_eq!(alloc.free_count(), before + 2);
        assert!(space.leaf(VA).is_none());
    }

    #[test]
    fn destroy_returns_every_frame() {
        let (phys, mut alloc) = setup(64);
        let (kroot, kpdpt) = kernel_root(&phys, &mut alloc);
        let before = alloc.free_count();

        let space = AddressSpace::create(&phys, &mut alloc, kroot).unwrap();
        space.map(&mut alloc, VA, None, 3 * PAGE_SIZE, MapFlags::user_rw()).unwrap();
        let far = VirtualAddress::new(0x7000_0000_0000);
        space.map(&mut alloc, far, None, PAGE_SIZE, MapFlags::user_rw()).unwrap();
        space.destroy(&mut alloc);

        assert_eq!(alloc.free_count(), before);
        assert!(alloc.is_allocated(kroot));
        assert!(alloc.is_allocated(kpdpt));
    }

    #[test]
    fn user_bytes_round_trip_across_pages() {
        let (phys, mut alloc) = setup(32);
        let (kroot, _) = kernel_root(&phys, &mut alloc);
        let space = AddressSpace::create(&phys, &mut alloc, kroot).unwrap();
        space.map(&mut alloc, VA, None, 2 * PAGE_SIZE, MapFlags::user_rw()).unwrap();

        let at = VA + (PAGE_SIZE - 3);
        space.write_bytes(at, b"hello!").unwrap();
        let mut out = [0u8; 6];
        space.read_bytes(at, &mut out).unwrap();
        assert_eq!(&out, b"hello!");

        space.fill(at, 2, b'x').unwrap();
        space.read_bytes(at, &mut out).unwrap();
        assert_eq!(&out, b"xxllo!");

        let mut past = [0u8; 8];
        assert_eq!(
            space.read_bytes(VA + (2 * PAGE_SIZE - 4), &mut past),
            Err(VmemError::NotMapped(VA + 2 * PAGE_SIZE))
        );
    }

    #[test]
    fn kernel_only_pages_are_not_user_accessible() {
        let (phys, mut alloc) = setup(32);
        let (kroot, _) = kernel_root(&phys, &mut alloc);
        let space = AddressSpace::create(&phys, &mut alloc, kroot).unwrap();
        let flags = MapFlags::new().with_writable(true);
        space.map(&mut alloc, VA, None, PAGE_SIZE, flags).unwrap();

        assert_eq!(space.write_bytes(VA, b"x"), Err(VmemError::NotMapped(VA)));
    }

    #[test]
    fn read_only_pages_reject_writes() {
        let (phys, mut alloc) = setup(32);
        let (kroot, _) = kernel_root(&phys, &mut alloc);
        let space = AddressSpace::create(&phys, &mut alloc, kroot).unwrap();
        space.map(&mut alloc, VA, None, PAGE_SIZE, MapFlags::user_rw()).unwrap();
        let ro = VA + PAGE_SIZE;
        space.map(&mut alloc, ro, None, PAGE_SIZE, MapFlags::new().with_user(true)).unwrap();

        // a write spanning both pages touches neither
        let at = VA + (PAGE_SIZE - 2);
        assert_eq!(space.write_bytes(at, b"abcd"), Err(VmemError::ReadOnly(ro)));
        assert_eq!(space.fill(ro, 1, 0xff), Err(VmemError::ReadOnly(ro)));
        let mut out = [0xAAu8; 4];
        space.read_bytes(at, &mut out).unwrap();
        assert_eq!(out, [0; 4]);
    }

    #[test]
    fn duplicate_copies_content_into_private_frames() {
        let (phys, mut alloc) = setup(64);
        let (kroot, _) = kernel_root(&phys, &mut alloc);
        let parent = AddressSpace::create(&phys, &mut alloc, kroot).unwrap();
        let ro = MapFlags::new().with_user(true);
        parent.map(&mut alloc, VA, None, PAGE_SIZE, MapFlags::user_rw()).unwrap();
        parent.map(&mut alloc, VA + PAGE_SIZE, None, PAGE_SIZE, ro).unwrap();
        parent.write_bytes(VA, b"parent").unwrap();

        let child = parent.duplicate(&mut alloc).unwrap();
        assert_eq!(child.user_page_count(), 2);
        assert_ne!(child.translate(VA), parent.translate(VA));
        assert_eq!(MapFlags::from_entry(child.leaf(VA + PAGE_SIZE).unwrap()), ro);

        let mut buf = [0u8; 6];
        child.read_bytes(VA, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");

        child.write_bytes(VA, b"child!").unwrap();
        parent.read_bytes(VA, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
    }

    #[test]
    fn failed_duplicate_leaks_nothing() {
        let (phys, mut alloc) = setup(24);
        let (kroot, _) = kernel_root(&phys, &mut alloc);
        let parent = AddressSpace::create(&phys, &mut alloc, kroot).unwrap();
        parent.map(&mut alloc, VA, None, 8 * PAGE_SIZE, MapFlags::user_rw()).unwrap();
        let before = alloc.free_count();
        assert!(before < 12, "child cannot fit: {before} frames free");

        assert_eq!(parent.duplicate(&mut alloc).err(), Some(VmemError::OutOfMemory));
        assert_eq!(alloc.free_count(), before);
        assert_eq!(parent.user_page_count(), 8);
    }
}
