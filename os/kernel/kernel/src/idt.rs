//! # Interrupt Descriptor Table
//!
//! Every vector the kernel expects is an interrupt gate (the CPU clears `IF`
//! on entry), so a handler never runs with interrupts enabled and traps do
//! not nest.
//!
//! | Vector        | Source              | DPL | Stack         |
//! |---------------|---------------------|-----|---------------|
//! | `0..32`       | CPU exceptions      | 0   | rsp0 / IST1   |
//! | `0x80`        | `int 0x80` syscalls | 3   | rsp0          |
//! | `0xE0`        | LAPIC timer         | 0   | rsp0          |
//! | `0xFF`        | LAPIC spurious      | 0   | current       |
//!
//! Load the GDT and TSS first; a gate that points at a missing TSS triple
//! faults on first use.

use crate::gdt::DescriptorTablePointer;
use crate::traps;
use crate::tss::DOUBLE_FAULT_IST;
use bitfield_struct::bitfield;
use kernel_info::config::{SPURIOUS_VECTOR, SYSCALL_VECTOR, TIMER_VECTOR};
use kernel_info::gdt::KERNEL_CS;
use kernel_sync::SyncOnceCell;

const DOUBLE_FAULT: u8 = 8;

#[bitfield(u16)]
pub struct GateAttributes {
    /// IST slot, 0 for none.
    #[bits(3)]
    pub ist: u8,
    #[bits(5)]
    __zero: u8,
    /// `0xE` interrupt gate, `0xF` trap gate.
    #[bits(4)]
    pub typ: u8,
    __s: bool,
    /// Lowest privilege level allowed to raise the vector with `int n`.
    #[bits(2)]
    pub dpl: u8,
    pub present: bool,
}

impl GateAttributes {
    const INTERRUPT_GATE: u8 = 0xE;

    #[must_use]
    pub const fn interrupt_gate(dpl: u8) -> Self {
        Self::new()
            .with_typ(Self::INTERRUPT_GATE)
            .with_dpl(dpl)
            .with_present(true)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct IdtEntry {
    offset_lo: u16,
    selector: u16,
    attributes: GateAttributes,
    offset_mid: u16,
    offset_hi: u32,
    _reserved: u32,
}

impl IdtEntry {
    /// A not-present gate; raising it ends in `#GP`, then `#DF`.
    pub const MISSING: Self = Self {
        offset_lo: 0,
        selector: 0,
        attributes: GateAttributes::new(),
        offset_mid: 0,
        offset_hi: 0,
        _reserved: 0,
    };

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(handler: u64, attributes: GateAttributes) -> Self {
        Self {
            offset_lo: handler as u16,
            selector: KERNEL_CS,
            attributes,
            offset_mid: (handler >> 16) as u16,
            offset_hi: (handler >> 32) as u32,
            _reserved: 0,
        }
    }

    #[must_use]
    pub fn handler(&self) -> u64 {
        u64::from(self.offset_lo) | (u64::from(self.offset_mid) << 16) | (u64::from(self.offset_hi) << 32)
    }

    #[must_use]
    pub const fn attributes(&self) -> GateAttributes {
        self.attributes
    }
}

#[repr(C, align(16))]
pub struct Idt {
    entries: [IdtEntry; 256],
}

const _: () = assert!(size_of::<IdtEntry>() == 16);
const _: () = assert!(size_of::<Idt>() == 4096);

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

impl Idt {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::MISSING; 256],
        }
    }

    /// Route `vector` to `handler` through a ring-0 interrupt gate.
    pub fn set_handler(&mut self, vector: u8, handler: unsafe extern "C" fn()) -> &mut IdtEntry {
        let entry = &mut self.entries[usize::from(vector)];
        *entry = IdtEntry::new(handler as usize as u64, GateAttributes::interrupt_gate(0));
        entry
    }

    #[must_use]
    pub fn entry(&self, vector: u8) -> &IdtEntry {
        &self.entries[usize::from(vector)]
    }

    /// The kernel's table: exception stubs, the syscall gate, the timer and
    /// the spurious vector.
    #[must_use]
    pub fn kernel() -> Self {
        let mut idt = Self::new();
        for (vector, stub) in (0u8..).zip(traps::EXCEPTION_STUBS) {
            idt.set_handler(vector, stub);
        }
        idt.set_handler(DOUBLE_FAULT, traps::EXCEPTION_STUBS[usize::from(DOUBLE_FAULT)])
            .set_ist(DOUBLE_FAULT_IST);
        idt.set_handler(SYSCALL_VECTOR, traps::syscall_entry).set_dpl(3);
        idt.set_handler(TIMER_VECTOR, traps::timer_entry);
        idt.set_handler(SPURIOUS_VECTOR, traps::spurious_entry);
        idt
    }
}

impl IdtEntry {
    pub const fn set_dpl(&mut self, dpl: u8) -> &mut Self {
        self.attributes = self.attributes.with_dpl(dpl);
        self
    }

    pub const fn set_ist(&mut self, ist: u8) -> &mut Self {
        self.attributes = self.attributes.with_ist(ist);
        self
    }
}

static IDT: SyncOnceCell<Idt> = SyncOnceCell::new();

/// Build the kernel IDT and load it into `IDTR`.
///
/// # Safety
/// Ring 0, GDT and TSS already loaded.
pub unsafe fn init() {
    let idt = IDT.get_or_init(Idt::kernel);
    let ptr = DescriptorTablePointer::new(core::ptr::from_ref(idt) as u64, size_of::<Idt>());

    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!(
            "lidt [{}]",
            in(reg) &raw const ptr,
            options(readonly, nostack, preserves_flags)
        );
    }
    #[cfg(not(target_os = "none"))]
    let _ = ptr;

    log::debug!(
        "IDT loaded: syscall {SYSCALL_VECTOR:#x}, timer {TIMER_VECTOR:#x}, spurious {SPURIOUS_VECTOR:#x}"
    );
}
