//! # Kernel Boot Information
//!
//! The boot collaborator hands the kernel a [`KernelBootInfo`] in `RDI`.
//! All pointers are kernel-virtual (HHDM or kernel image) addresses.

/// Kernel function pointer.
pub type KernelEntryFn = extern "C" fn(*const KernelBootInfo) -> !;

/// Information the kernel needs right after the boot handoff.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct KernelBootInfo {
    /// Firmware memory map, already translated into [`MemoryRegion`]s.
    pub memory_map: MemoryMapInfo,

    /// ELF image of the first user process.
    pub init_image: InitImage,
}

#[repr(C)]
#[derive(Clone, Debug)]
pub struct MemoryMapInfo {
    /// Pointer to an array of [`MemoryRegion`], ordered by base address.
    pub regions_ptr: u64,

    /// Number of entries behind `regions_ptr`.
    pub region_count: u64,
}

#[repr(C)]
#[derive(Clone, Debug)]
pub struct InitImage {
    /// Pointer to the first byte of the image.
    pub image_ptr: u64,

    /// Length of the image in bytes.
    pub image_len: u64,
}

/// One entry of the memory map.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Usable)
    }

    /// First address past the region, saturating.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }
}

/// Region type tag. Only [`MemoryRegionKind::Usable`] is handed to the
/// frame allocator.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryRegionKind {
    Usable = 0,
    Reserved = 1,
    AcpiReclaimable = 2,
    AcpiNvs = 3,
    BadMemory = 4,
    /// Kernel image, boot stacks, and the init image.
    KernelAndModules = 5,
}
