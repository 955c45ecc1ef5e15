//! # Typed `x86_64` Registers
//!
//! Bitfield models of the control registers the scheduler touches: `CR3`
//! (page-table root), `RFLAGS` (saved with every context), and the MSRs used
//! to drive the local APIC.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr3;
pub mod msr;
pub mod rflags;

pub use cr3::Cr3;
pub use msr::Msr;
pub use rflags::Rflags;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}
