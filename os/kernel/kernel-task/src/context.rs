use kernel_info::gdt::{KERNEL_CS, KERNEL_DS, USER_CS, USER_DS};
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};
use kernel_registers::rflags::Rflags;
use kernel_syscall::SyscallArgs;

/// Register state at a trap, laid out the way the entry stubs build it:
/// fifteen general-purpose registers pushed by software (`rax` lowest),
/// then the interrupt frame pushed by the CPU.
///
/// Restoring a context means writing it over the live frame and letting the
/// stub pop it and `iretq`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
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
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const _: () = assert!(size_of::<TrapFrame>() == 20 * 8);

impl TrapFrame {
    /// A fresh ring-3 context: all registers zero, interrupts enabled.
    #[must_use]
    pub const fn user(entry: VirtualAddress, stack_top: VirtualAddress) -> Self {
        Self::with_selectors(entry, stack_top, USER_CS, USER_DS)
    }

    /// A fresh ring-0 context, used for the idle loop.
    #[must_use]
    pub const fn kernel(entry: VirtualAddress, stack_top: VirtualAddress) -> Self {
        Self::with_selectors(entry, stack_top, KERNEL_CS, KERNEL_DS)
    }

    const fn with_selectors(rip: VirtualAddress, rsp: VirtualAddress, cs: u16, ss: u16) -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: rip.as_u64(),
            cs: cs as u64,
            rflags: Rflags::initial().into_bits(),
            rsp: rsp.as_u64(),
            ss: ss as u64,
        }
    }

    #[must_use]
    pub const fn syscall_number(&self) -> u64 {
        self.rax
    }

    #[must_use]
    pub const fn syscall_args(&self) -> SyscallArgs {
        SyscallArgs::new(self.rdi, self.rsi, self.rdx)
    }

    #[allow(clippy::cast_sign_loss)]
    pub const fn set_return(&mut self, value: i64) {
        self.rax = value as u64;
    }

    /// Whether this frame returns to ring 3.
    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// Everything needed to resume a process: its registers and its page-table
/// root.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CpuContext {
    pub frame: TrapFrame,
    pub root: PhysicalFrame,
}
