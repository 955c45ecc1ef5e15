//! Statically allocated kernel stacks.
//!
//! ```text
//! BOOT_STACK          _start_kernel .. first iretq
//! TRAP_STACK          TSS.rsp0: every trap taken from ring 3
//! DOUBLE_FAULT_STACK  TSS.ist1: #DF, whatever the state of the others
//! IDLE_STACK          the idle loop and traps taken while idling
//! ```
//!
//! Nothing ever runs on two of them at once: traps are interrupt gates, so
//! the kernel never nests.

use core::cell::UnsafeCell;
use kernel_info::memory::{IDLE_STACK_SIZE, KERNEL_STACK_SIZE};
use kernel_memory_addresses::VirtualAddress;

pub const BOOT_STACK_SIZE: usize = 64 * 1024;
pub const DOUBLE_FAULT_STACK_SIZE: usize = 16 * 1024;

/// A zero-initialized, 16-byte aligned stack that only the CPU writes.
#[repr(C, align(16))]
pub struct KernelStack<const N: usize>(UnsafeCell<[u8; N]>);

// SAFETY: the kernel never hands out references into a stack; the CPU is the
// only writer, through `rsp`.
unsafe impl<const N: usize> Sync for KernelStack<N> {}

impl<const N: usize> KernelStack<N> {
    const ALIGNED: () = assert!(N % 16 == 0);

    #[must_use]
    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::ALIGNED;
        Self(UnsafeCell::new([0; N]))
    }

    /// One past the highest byte; the initial `rsp`.
    #[must_use]
    pub fn top(&self) -> VirtualAddress {
        VirtualAddress::from_ptr(self.0.get().cast_const()) + N as u64
    }
}

impl<const N: usize> Default for KernelStack<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[unsafe(no_mangle)]
#[unsafe(link_section = ".bss.boot")]
pub static BOOT_STACK: KernelStack<BOOT_STACK_SIZE> = KernelStack::new();

pub static TRAP_STACK: KernelStack<KERNEL_STACK_SIZE> = KernelStack::new();

pub static DOUBLE_FAULT_STACK: KernelStack<DOUBLE_FAULT_STACK_SIZE> = KernelStack::new();

pub static IDLE_STACK: KernelStack<IDLE_STACK_SIZE> = KernelStack::new();
