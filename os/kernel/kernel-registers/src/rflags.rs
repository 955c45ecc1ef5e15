use bitfield_struct::bitfield;

/// Architectural RFLAGS model for x86-64.
///
/// Bits that are architecturally fixed in 64-bit mode carry their fixed
/// value as the default, so [`Rflags::new`] is always a valid image.
#[bitfield(u64, order = Lsb)]
pub struct Rflags {
    /// Carry Flag
    pub cf_carry: bool, // 0

    /// Always 1 in 64-bit mode.
    #[bits(default = true)]
    _always1: bool, // 1

    /// Parity Flag
    pub pf_parity: bool, // 2

    #[bits(default = false)]
    _rsvd3: bool, // 3

    /// Adjust Flag
    pub af_adjust: bool, // 4

    #[bits(default = false)]
    _rsvd5: bool, // 5

    /// Zero Flag
    pub zf_zero: bool, // 6

    /// Sign Flag
    pub sf_sign: bool, // 7

    /// Trap Flag
    pub tf_trap: bool, // 8

    /// Interrupt Enable Flag
    pub if_interrupt_enable: bool, // 9

    /// Direction Flag
    pub df_direction: bool, // 10

    /// Overflow Flag
    pub of_overflow: bool, // 11

    /// I/O Privilege Level (2 bits)
    #[bits(2)]
    pub iopl: u8, // 12–13

    /// Nested Task
    pub nt_nested: bool, // 14

    #[bits(default = false)]
    _rsvd15: bool, // 15

    /// Resume Flag
    pub rf_resume: bool, // 16

    /// Virtual 8086 mode: must be 0 in 64-bit mode.
    #[bits(default = false)]
    _vm: bool, // 17

    /// Alignment Check
    pub ac_alignment_check: bool, // 18

    /// Virtual Interrupt Flag
    pub vif_virtual_interrupt: bool, // 19

    /// Virtual Interrupt Pending
    pub vip_virtual_interrupt_pending: bool, // 20

    /// ID Flag: allows toggling CPUID.
    pub id_cpuid: bool, // 21

    #[bits(42, default = false)]
    _reserved_rest: u64,
}

impl Rflags {
    /// Flags a freshly created context starts with: interrupts enabled,
    /// IOPL 0, everything else clear (`0x202`).
    #[must_use]
    pub const fn initial() -> Self {
        Self::new().with_if_interrupt_enable(true)
    }

    /// Clear every bit user code may not choose for itself (IOPL, NT, VM,
    /// reserved bits) and force `IF` on.
    #[must_use]
    pub const fn sanitized_for_user(self) -> Self {
        self.with_iopl(0)
            .with_nt_nested(false)
            .with_if_interrupt_enable(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_is_0x202() {
        assert_eq!(Rflags::initial().into_bits(), 0x202);
    }

    #[test]
    fn sanitize_drops_iopl_and_keeps_arithmetic_flags() {
        let raw = Rflags::from_bits(0x3000 | 0x4000 | 0x41 | 0x2);
        let clean = raw.sanitized_for_user();
        assert_eq!(clean.iopl(), 0);
        assert!(!clean.nt_nested());
        assert!(clean.zf_zero() && clean.cf_carry());
        assert!(clean.if_interrupt_enable());
    }
}
