//! # 64-bit Task State Segment
//!
//! Long mode does no hardware task switching, but the CPU still reads the TSS
//! on two occasions:
//!
//! - a gate that raises the privilege level (any trap from ring 3) loads
//!   `rsp` from `rsp0` before pushing the interrupt frame;
//! - a gate with a non-zero IST index always switches to that IST slot.
//!
//! The kernel uses one ring-0 stack for every process. That is sound because
//! a trap handler never sleeps on it: it either returns to the interrupted
//! context or overwrites the frame with another one and returns to that.

use crate::stack::{DOUBLE_FAULT_STACK, TRAP_STACK};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SyncOnceCell;

/// IST slot reserved for `#DF`, as encoded in an IDT gate. Its stack is
/// `ist[0]`.
pub const DOUBLE_FAULT_IST: u8 = 1;

#[repr(C, packed(4))]
pub struct Tss64 {
    _reserved0: u32,
    /// Privilege stack table; only `rsp[0]` is used.
    pub rsp: [VirtualAddress; 3],
    _reserved1: u64,
    /// Interrupt stack table, `ist[0]` is IST1.
    pub ist: [VirtualAddress; 7],
    _reserved2: u64,
    _reserved3: u16,
    /// Offset of the I/O permission bitmap. Pointing past the end of the
    /// segment denies all port I/O from ring 3.
    pub iopb_offset: u16,
}

const _: () = assert!(size_of::<Tss64>() == 104);

impl Tss64 {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(rsp0: VirtualAddress, ist1: VirtualAddress) -> Self {
        let mut ist = [VirtualAddress::zero(); 7];
        ist[0] = ist1;
        Self {
            _reserved0: 0,
            rsp: [rsp0, VirtualAddress::zero(), VirtualAddress::zero()],
            _reserved1: 0,
            ist,
            _reserved2: 0,
            _reserved3: 0,
            iopb_offset: size_of::<Self>() as u16,
        }
    }
}

static TSS: SyncOnceCell<Tss64> = SyncOnceCell::new();

/// The kernel's TSS, built on first use around the static trap stacks.
#[must_use]
pub fn init() -> &'static Tss64 {
    TSS.get_or_init(|| Tss64::new(TRAP_STACK.top(), DOUBLE_FAULT_STACK.top()))
}
