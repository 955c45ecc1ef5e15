//! # Physical and Virtual Memory Address Types
//!
//! Thin `#[repr(transparent)]` wrappers around `u64` that keep physical and
//! virtual addresses apart at compile time.
//!
//! | Type                | Meaning                                        |
//! |---------------------|------------------------------------------------|
//! | [`PhysicalAddress`] | a byte address in physical memory (RAM, MMIO)  |
//! | [`VirtualAddress`]  | a byte address translated by the page tables   |
//! | [`PhysicalFrame`]   | a 4 KiB-aligned physical frame                 |
//! | [`VirtualPage`]     | a 4 KiB-aligned virtual page                   |
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0040_1234);
//! assert_eq!(va.page().base().as_u64(), 0x0040_1000);
//! assert_eq!(va.page_offset(), 0x234);
//!
//! let frame = PhysicalFrame::from_index(3);
//! assert_eq!(frame.base(), PhysicalAddress::new(0x3000));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod address;
mod frame;

pub use address::{PhysicalAddress, VirtualAddress};
pub use frame::{PhysicalFrame, VirtualPage};

/// Size of a base page / frame in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Number of low address bits covered by one base page.
pub const PAGE_SHIFT: u32 = 12;

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Round `value` up to a multiple of `align` (a power of two).
///
/// Saturates at the highest aligned value instead of wrapping.
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => v & !(align - 1),
        None => u64::MAX & !(align - 1),
    }
}
