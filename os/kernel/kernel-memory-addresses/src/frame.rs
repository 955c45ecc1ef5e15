use crate::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, VirtualAddress};
use core::fmt;

/// A 4 KiB-aligned physical frame, identified by its frame index.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalFrame(u64);

impl PhysicalFrame {
    #[inline]
    #[must_use]
    pub const fn from_index(index: u64) -> Self {
        Self(index)
    }

    /// The frame that contains `pa`.
    #[inline]
    #[must_use]
    pub const fn containing(pa: PhysicalAddress) -> Self {
        Self(pa.as_u64() >> PAGE_SHIFT)
    }

    /// The frame starting exactly at `pa`, or `None` if `pa` is not 4 KiB-aligned.
    #[inline]
    #[must_use]
    pub const fn from_address(pa: PhysicalAddress) -> Option<Self> {
        if pa.is_page_aligned() {
            Some(Self::containing(pa))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }

    /// The frame `n` frames after this one.
    #[inline]
    #[must_use]
    pub const fn next(self, n: u64) -> Self {
        Self(self.0 + n)
    }
}

impl fmt::Debug for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame(#{} @ 0x{:X})", self.0, self.base().as_u64())
    }
}

/// A 4 KiB-aligned virtual page.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(u64);

impl VirtualPage {
    #[inline]
    #[must_use]
    pub const fn containing(va: VirtualAddress) -> Self {
        Self(va.as_u64() & !(PAGE_SIZE - 1))
    }

    #[inline]
    #[must_use]
    pub const fn from_address(va: VirtualAddress) -> Option<Self> {
        if va.is_page_aligned() {
            Some(Self(va.as_u64()))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.0)
    }

    /// The page `n` pages after this one.
    #[inline]
    #[must_use]
    pub const fn next(self, n: u64) -> Self {
        Self(self.0 + n * PAGE_SIZE)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page(0x{:016X})", self.0)
    }
}
