use crate::PageEntryBits;
use core::ops::{Index, IndexMut};
use kernel_info::memory::{KERNEL_HALF_FIRST_INDEX, PAGE_TABLE_ENTRIES};
use kernel_memory_addresses::VirtualAddress;

/// A 9-bit page-table index (`0..512`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// `None` if `index >= 512`.
    #[must_use]
    pub const fn new(index: usize) -> Option<Self> {
        if index < PAGE_TABLE_ENTRIES {
            #[allow(clippy::cast_possible_truncation)]
            Some(Self(index as u16))
        } else {
            None
        }
    }

    /// Extract the index `level` selects from `va`.
    #[must_use]
    pub const fn of(va: VirtualAddress, level: Level) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self(((va.as_u64() >> level.shift()) & 0x1ff) as u16)
    }

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Whether a PML4 slot with this index belongs to the shared kernel half.
    #[must_use]
    pub const fn is_kernel_half(self) -> bool {
        self.as_usize() >= KERNEL_HALF_FIRST_INDEX
    }
}

/// Page-table level, numbered as the hardware walks it (4 = root).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Level {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl Level {
    /// Bit position of the lowest address bit this level's index covers.
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Bytes mapped by one entry at this level.
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// The level below, or `None` for the leaf table.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }
}

/// Split `va` into its `[PML4, PDPT, PD, PT]` indices.
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> [TableIndex; 4] {
    [
        TableIndex::of(va, Level::Pml4),
        TableIndex::of(va, Level::Pdpt),
        TableIndex::of(va, Level::Pd),
        TableIndex::of(va, Level::Pt),
    ]
}

/// One 4 KiB page table of any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; PAGE_TABLE_ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    pub fn zero(&mut self) {
        self.entries.fill(PageEntryBits::new());
    }

    pub fn iter(&self) -> impl Iterator<Item = (TableIndex, PageEntryBits)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| TableIndex::new(i).map(|i| (i, *e)))
    }

    /// Copy the kernel half (slots `256..512`) from `kernel` verbatim.
    pub fn copy_kernel_half(&mut self, kernel: &Self) {
        self.entries[KERNEL_HALF_FIRST_INDEX..]
            .copy_from_slice(&kernel.entries[KERNEL_HALF_FIRST_INDEX..]);
    }

    /// Clear the user half (slots `0..256`).
    pub fn clear_user_half(&mut self) {
        self.entries[..KERNEL_HALF_FIRST_INDEX].fill(PageEntryBits::new());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(PageEntryBits::is_unused)
    }
}

impl Index<TableIndex> for PageTable {
    type Output = PageEntryBits;

    fn index(&self, index: TableIndex) -> &PageEntryBits {
        &self.entries[index.as_usize()]
    }
}

impl IndexMut<TableIndex> for PageTable {
    fn index_mut(&mut self, index: TableIndex) -> &mut PageEntryBits {
        &mut self.entries[index.as_usize()]
    }
}
