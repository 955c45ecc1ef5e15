use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame};

/// CR3: Page-Map Level-4 Base Register (IA-32e, PCID disabled).
///
/// Holds the physical frame of the PML4 table and cache-control flags
/// for PML4 walks. Writing it switches the active address space and flushes
/// all non-global TLB entries.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2: Reserved (must be 0).
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3: PWT: Page-level Write-Through for PML4.
    pub pwt: bool,

    /// Bit 4: PCD: Page-level Cache Disable for PML4.
    pub pcd: bool,

    /// Bits 5–11: Reserved (must be 0 when written).
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–51: PML4 physical frame number.
    #[bits(40)]
    pml4_frame: u64,

    /// Bits 52–63: Reserved.
    #[bits(12)]
    pub reserved2: u16,
}

impl Cr3 {
    /// A `Cr3` value selecting `pml4` with write-back caching.
    #[must_use]
    pub const fn from_pml4(pml4: PhysicalFrame) -> Self {
        Self::new().with_pml4_frame(pml4.index())
    }

    #[must_use]
    pub const fn pml4(&self) -> PhysicalFrame {
        PhysicalFrame::from_index(self.pml4_frame())
    }

    #[must_use]
    pub const fn pml4_phys(&self) -> PhysicalAddress {
        self.pml4().base()
    }
}

#[cfg(feature = "asm")]
impl crate::LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl crate::StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
