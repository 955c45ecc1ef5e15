//! # Kernel Tunables

use log::LevelFilter;

/// Capacity of the process table.
pub const MAX_PROCESSES: usize = 64;

/// Timer ticks a process may run before it is preempted.
pub const SCHEDULER_QUANTUM_TICKS: u32 = 1;

/// IDT vector of the LAPIC timer interrupt.
pub const TIMER_VECTOR: u8 = 0xE0;

/// IDT vector of the `int 0x80` syscall gate.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// IDT vector the LAPIC reports spurious interrupts on.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// LAPIC timer divide configuration (`0b0011` = divide by 16).
pub const LAPIC_TIMER_DIVIDER: u32 = 0b0011;

/// Initial count of the periodic LAPIC timer, in divided bus ticks.
///
/// With QEMU's 1 GHz nominal APIC bus and a divider of 16 this is
/// a 10 ms quantum.
pub const LAPIC_TIMER_INITIAL_COUNT: u32 = 625_000;

/// Highest order the buddy allocator merges up to (`2^order` frames).
pub const BUDDY_MAX_ORDER: usize = 10;

/// Maximum level emitted by the kernel logger.
pub const LOG_LEVEL: LevelFilter = LevelFilter::Debug;

const _: () = {
    assert!(MAX_PROCESSES >= 2);
    assert!(SCHEDULER_QUANTUM_TICKS > 0);
    assert!(TIMER_VECTOR >= 32 && SYSCALL_VECTOR >= 32);
    assert!(BUDDY_MAX_ORDER < 32);
};
