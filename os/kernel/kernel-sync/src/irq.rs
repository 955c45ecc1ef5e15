//! Interrupt masking.
//!
//! On bare metal (`target_os = "none"`) these issue `cli`/`sti` and read
//! `RFLAGS.IF`. Hosted builds (unit tests) have no interrupts to mask, so the
//! primitives degrade to no-ops and report interrupts as disabled.

/// `RFLAGS.IF`
const RFLAGS_IF: u64 = 1 << 9;

/// Disables hardware interrupts (`cli`).
#[inline]
pub fn cli_stop_interrupts() {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enables hardware interrupts (`sti`).
#[inline]
pub fn sti_enable_interrupts() {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Returns the current `RFLAGS` value (via `pushfq/pop`).
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    #[cfg(target_os = "none")]
    {
        let r: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags));
        }
        r
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    rflags() & RFLAGS_IF != 0
}

/// Enable interrupts and halt until the next one arrives.
///
/// `sti` takes effect after the following instruction, so no interrupt can
/// slip in between the two.
#[inline]
pub fn enable_and_halt() {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("sti; hlt", options(nomem, nostack));
    }
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Only re-enables interrupts if they were enabled when the guard was taken,
/// so guards nest.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
