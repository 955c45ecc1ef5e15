//! # Trap entry stubs
//!
//! Every stub saves the fifteen general-purpose registers on top of the
//! CPU's interrupt frame, which makes the stack a [`TrapFrame`]:
//!
//! ```text
//! higher addresses
//!   ss, rsp, rflags, cs, rip     pushed by the CPU
//!   r15 .. rbx, rax              pushed by the stub (rax ends up lowest)
//! rsp ──► &mut TrapFrame         passed to the Rust handler in rdi
//! ```
//!
//! The handler may overwrite the frame with a different context; the stub
//! then pops whatever is there and `iretq`s into it. That is the whole
//! context switch.
//!
//! The CPU aligns `rsp` to 16 bytes before pushing its five words, so after
//! fifteen more the stack is 16-byte aligned again at the `call`.

use crate::{KERNEL, apic, halt_forever};
use core::arch::naked_asm;
use kernel_task::TrapFrame;
use log::error;

macro_rules! trap_stub {
    ($name:ident => $handler:path) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            naked_asm!(
                "push r15", "push r14", "push r13", "push r12",
                "push r11", "push r10", "push r9", "push r8",
                "push rbp", "push rdi", "push rsi", "push rdx",
                "push rcx", "push rbx", "push rax",
                "cld",
                "mov rdi, rsp",
                "call {handler}",
                "pop rax", "pop rbx", "pop rcx", "pop rdx",
                "pop rsi", "pop rdi", "pop rbp", "pop r8",
                "pop r9", "pop r10", "pop r11", "pop r12",
                "pop r13", "pop r14", "pop r15",
                "iretq",
                handler = sym $handler,
            );
        }
    };
}

trap_stub!(timer_entry => timer_trap);
trap_stub!(syscall_entry => syscall_trap);

/// The LAPIC does not expect an EOI for its spurious vector.
#[unsafe(naked)]
pub extern "C" fn spurious_entry() {
    naked_asm!("iretq");
}

extern "C" fn timer_trap(frame: &mut TrapFrame) {
    if let Some(kernel) = KERNEL.get() {
        kernel.lock().handle_timer(frame);
    }
    apic::end_of_interrupt();
}

extern "C" fn syscall_trap(frame: &mut TrapFrame) {
    match KERNEL.get() {
        Some(kernel) => kernel.lock().handle_syscall(frame),
        None => error!("syscall before the kernel was initialized"),
    }
}

/// Register state at a CPU exception: the general-purpose registers, the
/// vector, the error code (zero when the CPU pushes none) and the interrupt
/// frame.
#[repr(C)]
#[derive(Debug)]
pub struct ExceptionFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Exceptions are fatal: report and halt.
extern "C" fn exception_trap(frame: &ExceptionFrame) -> ! {
    error!(
        "unhandled {} (#{}) error={:#x} rip={:#x} cs={:#x} rflags={:#x} rsp={:#x}",
        exception_name(frame.vector),
        frame.vector,
        frame.error_code,
        frame.rip,
        frame.cs,
        frame.rflags,
        frame.rsp,
    );
    if frame.vector == PAGE_FAULT {
        error!("faulting address {:#x}", read_cr2());
    }
    halt_forever()
}

const PAGE_FAULT: u64 = 14;

fn read_cr2() -> u64 {
    #[cfg(target_os = "none")]
    {
        let cr2: u64;
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        cr2
    }
    #[cfg(not(target_os = "none"))]
    0
}

#[unsafe(naked)]
extern "C" fn exception_common() {
    naked_asm!(
        "push r15", "push r14", "push r13", "push r12",
        "push r11", "push r10", "push r9", "push r8",
        "push rbp", "push rdi", "push rsi", "push rdx",
        "push rcx", "push rbx", "push rax",
        "cld",
        "mov rdi, rsp",
        "call {handler}",
        "ud2",
        handler = sym exception_trap,
    );
}

macro_rules! exception_stub {
    ($name:ident = $vector:literal) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym exception_common,
            );
        }
    };
    // The CPU already pushed an error code.
    ($name:ident = $vector:literal, error_code) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            naked_asm!(
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym exception_common,
            );
        }
    };
}

macro_rules! exception_stubs {
    ($($name:ident = $vector:literal $(, $error:ident)?;)*) => {
        $(exception_stub!($name = $vector $(, $error)?);)*

        /// Entry stubs for vectors `0..32`, indexed by vector.
        pub const EXCEPTION_STUBS: [unsafe extern "C" fn(); 32] = [$($name),*];
    };
}

exception_stubs! {
    divide_error = 0;
    debug = 1;
    nmi = 2;
    breakpoint = 3;
    overflow = 4;
    bound_range = 5;
    invalid_opcode = 6;
    device_not_available = 7;
    double_fault = 8, error_code;
    coprocessor_overrun = 9;
    invalid_tss = 10, error_code;
    segment_not_present = 11, error_code;
    stack_fault = 12, error_code;
    general_protection = 13, error_code;
    page_fault = 14, error_code;
    reserved_15 = 15;
    x87_floating_point = 16;
    alignment_check = 17, error_code;
    machine_check = 18;
    simd_floating_point = 19;
    virtualization = 20;
    control_protection = 21, error_code;
    reserved_22 = 22;
    reserved_23 = 23;
    reserved_24 = 24;
    reserved_25 = 25;
    reserved_26 = 26;
    reserved_27 = 27;
    hypervisor_injection = 28;
    vmm_communication = 29, error_code;
    security = 30, error_code;
    reserved_31 = 31;
}

const fn exception_name(vector: u64) -> &'static str {
    match vector {
        0 => "#DE divide error",
        1 => "#DB debug",
        2 => "NMI",
        3 => "#BP breakpoint",
        4 => "#OF overflow",
        5 => "#BR bound range",
        6 => "#UD invalid opcode",
        7 => "#NM device not available",
        8 => "#DF double fault",
        10 => "#TS invalid TSS",
        11 => "#NP segment not present",
        12 => "#SS stack fault",
        13 => "#GP general protection",
        14 => "#PF page fault",
        16 => "#MF x87 floating point",
        17 => "#AC alignment check",
        18 => "#MC machine check",
        19 => "#XM SIMD floating point",
        20 => "#VE virtualization",
        21 => "#CP control protection",
        _ => "exception",
    }
}
