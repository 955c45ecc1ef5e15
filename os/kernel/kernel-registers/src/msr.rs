//! # Model-Specific Registers (MSR)

/// Identifies a **Model-Specific Register (MSR)** by its architectural index.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Msr(pub u32);

impl Msr {
    /// `IA32_APIC_BASE`: global enable (bit 11) and x2APIC mode (bit 10).
    pub const IA32_APIC_BASE: Self = Self(0x1B);
    pub const X2APIC_ID: Self = Self(0x802);
    pub const X2APIC_EOI: Self = Self(0x80B);
    pub const X2APIC_SVR: Self = Self(0x80F);
    pub const X2APIC_LVT_TIMER: Self = Self(0x832);
    pub const X2APIC_TIMER_INITIAL_COUNT: Self = Self(0x838);
    pub const X2APIC_TIMER_DIVIDE: Self = Self(0x83E);

    /// Returns the underlying raw MSR index.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Write a 64-bit value to the MSR (`wrmsr`).
    ///
    /// # Safety
    /// Ring 0 only; the MSR must exist and accept the value, otherwise the CPU
    /// raises `#GP(0)`.
    #[cfg(feature = "asm")]
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn store_raw(self, val: u64) {
        let lo = (val & 0xFFFF_FFFF) as u32;
        let hi = (val >> 32) as u32;
        unsafe {
            core::arch::asm!(
                "wrmsr",
                in("ecx") self.0,
                in("eax") lo,
                in("edx") hi,
                options(nostack, preserves_flags)
            );
        }
    }

    /// Read the 64-bit value of the MSR (`rdmsr`).
    ///
    /// # Safety
    /// Ring 0 only; the MSR must exist.
    #[cfg(feature = "asm")]
    #[inline]
    pub unsafe fn load_raw(self) -> u64 {
        let lo: u32;
        let hi: u32;
        unsafe {
            core::arch::asm!(
                "rdmsr",
                in("ecx") self.0,
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags)
            );
        }
        (u64::from(hi) << 32) | u64::from(lo)
    }
}
