//! # Kernel Configuration and Boot Interface
//!
//! Compile-time layout constants, tunables, and the `#[repr(C)]` handoff
//! structures shared between the boot collaborator and the kernel.
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   User Space (per process,      │
//!                       │   PML4 entries 0..256)          │
//! USER_STACK_TOP        ├─────────────────────────────────┤ 0x0000_7fff_ffff_f000
//! USER_SPACE_END        ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │   non-canonical hole            │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │   Kernel Text & Data            │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Everything above `USER_SPACE_END` lives in PML4 entries 256..512 and is
//! shared verbatim by every address space.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod config;
pub mod gdt;
pub mod memory;
