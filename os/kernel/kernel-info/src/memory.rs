//! # Memory Layout

/// First address past the user half of the virtual address space.
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// First PML4 slot belonging to the shared kernel half.
pub const KERNEL_HALF_FIRST_INDEX: usize = 256;

/// Number of entries in every page-table level.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA), matches the linker script.
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the kernel image sits in *physical* memory (LMA).
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// Highest address of every process's user stack (exclusive).
pub const USER_STACK_TOP: u64 = 0x0000_7fff_ffff_f000;

/// Number of 4 KiB pages mapped for a user stack.
pub const USER_STACK_PAGES: u64 = 4;

/// Lowest mapped address of the user stack.
pub const USER_STACK_BASE: u64 = USER_STACK_TOP - USER_STACK_PAGES * 4096;

/// The size of the ring-0 trap stack loaded into `TSS.rsp0`.
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

/// The size of the stack the idle loop runs on.
pub const IDLE_STACK_SIZE: usize = 4096;

const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(4096));
    assert!(USER_STACK_TOP.is_multiple_of(4096));
    assert!(USER_STACK_TOP < USER_SPACE_END);
    assert!(USER_STACK_BASE < USER_STACK_TOP);
    assert!(HHDM_BASE >= USER_SPACE_END);
    assert!(KERNEL_BASE > HHDM_BASE);
    // Bit 47 selects the PML4 half.
    assert!(USER_SPACE_END >> 39 == KERNEL_HALF_FIRST_INDEX as u64);
};
