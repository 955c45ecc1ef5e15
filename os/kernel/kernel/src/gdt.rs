//! # Global Descriptor Table and Task Register
//!
//! Long mode ignores base and limit for code and data segments, but the
//! selectors still carry the privilege level the CPU checks on every
//! `iretq` and gate transition, and the TSS descriptor is how the CPU finds
//! the ring-0 stack when a user-mode process traps.
//!
//! Index | Selector | Meaning
//! ------|----------|--------
//! 0     | 0x00     | Null
//! 1     | 0x08     | Kernel code (64-bit, DPL 0)
//! 2     | 0x10     | Kernel data (DPL 0)
//! 3     | 0x1b     | User data (DPL 3, RPL 3)
//! 4     | 0x23     | User code (64-bit, DPL 3, RPL 3)
//! 5/6   | 0x28     | TSS (16-byte system descriptor)
//!
//! The user data descriptor sits below user code so the layout also suits
//! `sysret` should the kernel ever use it.

use crate::tss::{self, Tss64};
use bitfield_struct::bitfield;
use kernel_info::gdt::{KERNEL_CS, KERNEL_DS, TSS_SEL};
use kernel_sync::SyncOnceCell;

/// A code or data segment descriptor.
#[bitfield(u64)]
pub struct SegmentDescriptor {
    pub limit_lo: u16,
    pub base_lo: u16,
    pub base_mid: u8,
    /// `0b1010` execute/read code, `0b0010` read/write data.
    #[bits(4)]
    pub typ: u8,
    /// Code/data (as opposed to system) descriptor.
    pub s: bool,
    #[bits(2)]
    pub dpl: u8,
    pub present: bool,
    #[bits(4)]
    pub limit_hi: u8,
    pub avl: bool,
    /// 64-bit code segment.
    pub long_mode: bool,
    /// Must be clear when `long_mode` is set.
    pub db: bool,
    pub granularity: bool,
    pub base_hi: u8,
}

impl SegmentDescriptor {
    const CODE_EXEC_READ: u8 = 0b1010;
    const DATA_READ_WRITE: u8 = 0b0010;

    /// A 64-bit code segment for privilege level `dpl`.
    #[must_use]
    pub const fn code(dpl: u8) -> Self {
        Self::new()
            .with_typ(Self::CODE_EXEC_READ)
            .with_s(true)
            .with_dpl(dpl)
            .with_present(true)
            .with_long_mode(true)
    }

    /// A read/write data segment for privilege level `dpl`.
    #[must_use]
    pub const fn data(dpl: u8) -> Self {
        Self::new()
            .with_typ(Self::DATA_READ_WRITE)
            .with_s(true)
            .with_dpl(dpl)
            .with_present(true)
    }
}

/// Low half of the 16-byte TSS descriptor.
#[bitfield(u64)]
pub struct TssDescriptorLow {
    pub limit_lo: u16,
    pub base_lo: u16,
    pub base_mid: u8,
    /// `0b1001` available 64-bit TSS; the CPU flips it to busy on `ltr`.
    #[bits(4)]
    pub typ: u8,
    pub zero: bool,
    #[bits(2)]
    pub dpl: u8,
    pub present: bool,
    #[bits(4)]
    pub limit_hi: u8,
    pub avl: bool,
    #[bits(2)]
    pub reserved: u8,
    pub granularity: bool,
    pub base_hi: u8,
}

/// The 16-byte system descriptor pointing at a [`Tss64`].
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct TssDescriptor {
    pub low: TssDescriptorLow,
    /// Bits 63..32 of the TSS base; the upper dword is reserved.
    pub high: u64,
}

impl TssDescriptor {
    const AVAILABLE_TSS64: u8 = 0b1001;

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(base: u64, limit: u32) -> Self {
        let low = TssDescriptorLow::new()
            .with_limit_lo((limit & 0xFFFF) as u16)
            .with_base_lo((base & 0xFFFF) as u16)
            .with_base_mid(((base >> 16) & 0xFF) as u8)
            .with_typ(Self::AVAILABLE_TSS64)
            .with_present(true)
            .with_limit_hi(((limit >> 16) & 0xF) as u8)
            .with_base_hi(((base >> 24) & 0xFF) as u8);
        Self {
            low,
            high: base >> 32,
        }
    }
}

/// The table as loaded by `lgdt`; field order fixes the selector values in
/// [`kernel_info::gdt`].
#[repr(C, align(16))]
pub struct Gdt {
    pub null: u64,
    pub kernel_code: SegmentDescriptor,
    pub kernel_data: SegmentDescriptor,
    pub user_data: SegmentDescriptor,
    pub user_code: SegmentDescriptor,
    pub tss: TssDescriptor,
}

const _: () = {
    assert!(size_of::<SegmentDescriptor>() == 8);
    assert!(size_of::<TssDescriptor>() == 16);
    assert!(size_of::<Gdt>() == 7 * 8 + 8);
    assert!(core::mem::offset_of!(Gdt, kernel_code) == KERNEL_CS as usize);
    assert!(core::mem::offset_of!(Gdt, kernel_data) == KERNEL_DS as usize);
    assert!(core::mem::offset_of!(Gdt, tss) == TSS_SEL as usize);
};

impl Gdt {
    /// The kernel's table with a TSS descriptor for `tss`.
    #[must_use]
    pub fn new(tss: &'static Tss64) -> Self {
        let base = core::ptr::from_ref(tss) as u64;
        #[allow(clippy::cast_possible_truncation)]
        let limit = (size_of::<Tss64>() - 1) as u32;
        Self {
            null: 0,
            kernel_code: SegmentDescriptor::code(0),
            kernel_data: SegmentDescriptor::data(0),
            user_data: SegmentDescriptor::data(3),
            user_code: SegmentDescriptor::code(3),
            tss: TssDescriptor::new(base, limit),
        }
    }

    /// The pseudo-descriptor for `lgdt`. Only the first `limit + 1` bytes
    /// are visible to the CPU.
    #[must_use]
    pub fn pointer(&'static self) -> DescriptorTablePointer {
        DescriptorTablePointer::new(core::ptr::from_ref(self) as u64, size_of::<Self>())
    }
}

/// Operand of `lgdt`/`lidt`.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct DescriptorTablePointer {
    pub limit: u16,
    pub base: u64,
}

impl DescriptorTablePointer {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(base: u64, size: usize) -> Self {
        Self {
            limit: (size - 1) as u16,
            base,
        }
    }
}

static GDT: SyncOnceCell<Gdt> = SyncOnceCell::new();

/// Build the GDT around the kernel's TSS, load it, reload every segment
/// register and load the task register.
///
/// # Safety
/// Ring 0 with interrupts masked; call once during boot.
pub unsafe fn init() {
    let gdt = GDT.get_or_init(|| Gdt::new(tss::init()));
    let ptr = gdt.pointer();

    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!(
            "lgdt [{ptr}]",
            // Far return to reload CS.
            "push {cs}",
            "lea {tmp}, [rip + 2f]",
            "push {tmp}",
            "retfq",
            "2:",
            "mov ds, {ds:x}",
            "mov es, {ds:x}",
            "mov ss, {ds:x}",
            "xor {tmp:e}, {tmp:e}",
            "mov fs, {tmp:x}",
            "mov gs, {tmp:x}",
            "ltr {tss:x}",
            ptr = in(reg) &raw const ptr,
            cs = const KERNEL_CS as u64,
            ds = in(reg) KERNEL_DS,
            tss = in(reg) TSS_SEL,
            tmp = out(reg) _,
        );
    }
    #[cfg(not(target_os = "none"))]
    let _ = ptr;

    log::debug!("GDT loaded at {:#x}, TR={TSS_SEL:#x}", core::ptr::from_ref(gdt) as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_descriptors_match_the_flat_model() {
        assert_eq!(SegmentDescriptor::code(0).into_bits(), 0x0020_9A00_0000_0000);
        assert_eq!(SegmentDescriptor::data(0).into_bits(), 0x0000_9200_0000_0000);
        assert_eq!(SegmentDescriptor::code(3).into_bits(), 0x0020_FA00_0000_0000);
        assert_eq!(SegmentDescriptor::data(3).into_bits(), 0x0000_F200_0000_0000);
    }

    #[test]
    fn tss_descriptor_splits_the_base() {
        let desc = TssDescriptor::new(0xffff_ffff_8012_3456, 0x67);
        assert_eq!(desc.low.limit_lo(), 0x67);
        assert_eq!(desc.low.base_lo(), 0x3456);
        assert_eq!(desc.low.base_mid(), 0x12);
        assert_eq!(desc.low.base_hi(), 0x80);
        assert_eq!(desc.low.typ(), 0b1001);
        assert!(desc.low.present());
        assert_eq!(desc.high, 0xffff_ffff);
    }

    #[test]
    fn table_pointer_limit_is_size_minus_one() {
        let ptr = DescriptorTablePointer::new(0x1000, size_of::<Gdt>());
        let limit = ptr.limit;
        assert_eq!(limit, 63);
    }
}
