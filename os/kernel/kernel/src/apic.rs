//! # Local APIC in x2APIC mode
//!
//! In x2APIC mode every LAPIC register is an MSR, so there is no MMIO page
//! to map. The kernel uses three of them beyond the enable bits: the
//! spurious vector register, the periodic timer and end-of-interrupt.

use bitfield_struct::bitfield;
use kernel_info::config::{LAPIC_TIMER_DIVIDER, LAPIC_TIMER_INITIAL_COUNT, SPURIOUS_VECTOR, TIMER_VECTOR};
use kernel_registers::Msr;
use log::info;

/// `IA32_APIC_BASE` global enable.
const APIC_ENABLE: u64 = 1 << 11;
/// `IA32_APIC_BASE` x2APIC mode.
const APIC_X2_MODE: u64 = 1 << 10;
/// `SVR` software enable.
const SVR_ENABLE: u64 = 1 << 8;
/// `CPUID.01H:ECX` x2APIC support.
const CPUID_X2APIC: u32 = 1 << 21;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApicError {
    #[error("the CPU does not support x2APIC mode")]
    NoX2Apic,
}

/// LVT timer register.
#[bitfield(u32)]
pub struct TimerLvt {
    pub vector: u8,
    #[bits(4)]
    __: u8,
    pub delivery_pending: bool,
    #[bits(3)]
    __: u8,
    pub masked: bool,
    #[bits(2)]
    pub mode: u8,
    #[bits(13)]
    __: u16,
}

impl TimerLvt {
    pub const ONE_SHOT: u8 = 0b00;
    pub const PERIODIC: u8 = 0b01;

    /// An unmasked periodic timer raising `vector`.
    #[must_use]
    pub const fn periodic(vector: u8) -> Self {
        Self::new().with_vector(vector).with_mode(Self::PERIODIC)
    }
}

/// Switch the LAPIC into x2APIC mode and enable it with the spurious vector.
/// Returns the APIC ID.
///
/// # Errors
/// [`ApicError::NoX2Apic`] if `CPUID` reports no x2APIC.
///
/// # Safety
/// Ring 0 only.
pub unsafe fn enable() -> Result<u32, ApicError> {
    if !has_x2apic() {
        return Err(ApicError::NoX2Apic);
    }
    let id = unsafe {
        let base = Msr::IA32_APIC_BASE.load_raw();
        Msr::IA32_APIC_BASE.store_raw(base | APIC_ENABLE | APIC_X2_MODE);
        Msr::X2APIC_SVR.store_raw(SVR_ENABLE | u64::from(SPURIOUS_VECTOR));
        Msr::X2APIC_ID.load_raw()
    };
    #[allow(clippy::cast_possible_truncation)]
    let id = id as u32;
    info!("x2APIC enabled, id {id:#x}");
    Ok(id)
}

/// Arm the periodic scheduler tick.
///
/// # Safety
/// Ring 0, after [`enable`], with the timer vector present in the IDT.
pub unsafe fn start_timer() {
    let lvt = TimerLvt::periodic(TIMER_VECTOR);
    unsafe {
        Msr::X2APIC_TIMER_DIVIDE.store_raw(u64::from(LAPIC_TIMER_DIVIDER));
        Msr::X2APIC_LVT_TIMER.store_raw(u64::from(lvt.into_bits()));
        Msr::X2APIC_TIMER_INITIAL_COUNT.store_raw(u64::from(LAPIC_TIMER_INITIAL_COUNT));
    }
    info!(
        "LAPIC timer: vector {TIMER_VECTOR:#x}, divide {LAPIC_TIMER_DIVIDER:#06b}, count {LAPIC_TIMER_INITIAL_COUNT}"
    );
}

/// Acknowledge the interrupt being serviced.
pub fn end_of_interrupt() {
    #[cfg(target_os = "none")]
    unsafe {
        Msr::X2APIC_EOI.store_raw(0);
    }
}

fn has_x2apic() -> bool {
    #[allow(unused_unsafe)]
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    leaf.ecx & CPUID_X2APIC != 0
}
