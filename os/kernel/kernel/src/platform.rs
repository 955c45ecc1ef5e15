//! The hardware side of the scheduler and syscall layer: `CR3` switching,
//! the idle context, the debug console and the first `iretq`.

use crate::stack::IDLE_STACK;
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};
use kernel_registers::{Cr3, StoreRegisterUnsafe};
use kernel_task::{Console, Cpu, TrapFrame};

/// The boot CPU.
#[derive(Debug, Default)]
pub struct X86Cpu;

impl Cpu for X86Cpu {
    fn switch_address_space(&mut self, root: PhysicalFrame) {
        // SAFETY: every root handed out by the process manager shares the
        // kernel half, so the code doing the switch stays mapped.
        unsafe { Cr3::from_pml4(root).store_unsafe() }
    }

    fn idle_context(&self) -> TrapFrame {
        // As if called: the return-address slot keeps rsp 16n+8 at entry.
        let stack = VirtualAddress::new(IDLE_STACK.top().as_u64() - 8);
        TrapFrame::kernel(VirtualAddress::new(idle_loop as usize as u64), stack)
    }
}

/// `write(1|2, ..)` output goes to the QEMU debug port.
#[derive(Debug, Default)]
pub struct DebugConsole;

impl Console for DebugConsole {
    fn write_bytes(&mut self, bytes: &[u8]) {
        kernel_qemu::write_bytes(bytes);
    }
}

/// Runs in ring 0 whenever nothing is Ready; the next tick replaces it.
extern "C" fn idle_loop() -> ! {
    loop {
        kernel_sync::irq::enable_and_halt();
    }
}

/// Load `frame` into the CPU and `iretq` into it.
///
/// # Safety
/// `frame` must describe a runnable context for the active address space,
/// with interrupts masked until the `iretq`.
pub unsafe fn enter_user_mode(frame: &TrapFrame) -> ! {
    unsafe {
        core::arch::asm!(
            "mov rsp, {frame}",
            "pop rax", "pop rbx", "pop rcx", "pop rdx",
            "pop rsi", "pop rdi", "pop rbp", "pop r8",
            "pop r9", "pop r10", "pop r11", "pop r12",
            "pop r13", "pop r14", "pop r15",
            "iretq",
            frame = in(reg) core::ptr::from_ref(frame),
            options(noreturn),
        );
    }
}
