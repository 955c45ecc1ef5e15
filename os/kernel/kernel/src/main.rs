//! # Kernel entry and bring-up
//!
//! The boot collaborator jumps to [`_start_kernel`] with a
//! [`KernelBootInfo`] in `rdi`, paging on, the kernel mapped at
//! `KERNEL_BASE` and all of RAM mapped at `HHDM_BASE`. From there:
//!
//! ```text
//! _start_kernel ── boot stack ──► kernel_main
//!   1. logger            QemuLogger on the debug port
//!   2. frames            BitmapFrameAlloc over the memory map
//!   3. GDT + TSS         ring-3 selectors, rsp0, IST1
//!   4. IDT               exceptions, int 0x80, timer, spurious
//!   5. x2APIC            enable, spurious vector
//!   6. PID 1             load the init image
//!   7. LAPIC timer       periodic scheduler tick
//!   8. iretq             into PID 1, never to return
//! ```
//!
//! After step 8 the kernel only runs in trap handlers, each of which locks
//! [`KERNEL`] for its duration.

#![cfg_attr(target_os = "none", no_std, no_main)]
#![allow(unsafe_code)]

mod apic;
mod gdt;
mod idt;
mod platform;
mod stack;
mod traps;
mod tss;

use crate::platform::{DebugConsole, X86Cpu};
use core::arch::naked_asm;
use kernel_alloc::{BitmapFrameAlloc, HhdmPhysMapper, LockedFrameAlloc, MemoryMapError};
use kernel_info::boot::{KernelBootInfo, KernelEntryFn, MemoryRegion};
use kernel_info::config::LOG_LEVEL;
use kernel_qemu::{QemuLogger, qemu_trace};
use kernel_registers::{Cr3, LoadRegisterUnsafe};
use kernel_sync::{SpinLock, SyncOnceCell};
use kernel_task::{Kernel, ProcessError, TrapFrame};
use log::{error, info};

type Frames = LockedFrameAlloc<BitmapFrameAlloc<'static>>;

pub type KernelState = Kernel<'static, HhdmPhysMapper, &'static Frames, X86Cpu, DebugConsole>;

static LOGGER: QemuLogger = QemuLogger::new(LOG_LEVEL);
static MAPPER: HhdmPhysMapper = HhdmPhysMapper;
static FRAMES: SyncOnceCell<Frames> = SyncOnceCell::new();

/// Everything the trap handlers operate on. Set once, right before the
/// first `iretq`.
pub static KERNEL: SyncOnceCell<SpinLock<KernelState>> = SyncOnceCell::new();

#[derive(Debug, thiserror::Error)]
enum BootError {
    #[error("memory map: {0}")]
    MemoryMap(#[from] MemoryMapError),
    #[error("boot handoff: {0} does not fit the address space")]
    Handoff(&'static str),
    #[error("{0} initialized twice")]
    AlreadyInitialized(&'static str),
    #[error("local APIC: {0}")]
    Apic(#[from] apic::ApicError),
    #[error("cannot start init: {0}")]
    Init(#[from] ProcessError),
}

const _: KernelEntryFn = _start_kernel;

/// Switch to the boot stack and call [`kernel_main`]; `rdi` passes through.
#[unsafe(naked)]
#[unsafe(no_mangle)]
pub extern "C" fn _start_kernel(_boot_info: *const KernelBootInfo) -> ! {
    naked_asm!(
        "cli",
        "lea rsp, [rip + {stack} + {size}]",
        "xor ebp, ebp",
        "call {entry}",
        "2:",
        "hlt",
        "jmp 2b",
        stack = sym stack::BOOT_STACK,
        size = const stack::BOOT_STACK_SIZE,
        entry = sym kernel_main,
    );
}

extern "C" fn kernel_main(boot_info: *const KernelBootInfo) -> ! {
    if LOGGER.install().is_err() {
        qemu_trace!("logger already installed\n");
        halt_forever()
    }

    // SAFETY: the loader passes a pointer to a live handoff block or null.
    let Some(boot_info) = (unsafe { boot_info.as_ref() }) else {
        error!("no boot information");
        halt_forever()
    };

    match unsafe { boot(boot_info) } {
        // SAFETY: `first` is PID 1 with its address space active, and
        // interrupts have been masked since `_start_kernel`.
        Ok(first) => unsafe { platform::enter_user_mode(&first) },
        Err(e) => {
            error!("boot failed: {e}");
            halt_forever()
        }
    }
}

/// Bring the machine up and return the first context to run.
///
/// # Safety
/// Once, on the boot CPU, with interrupts masked.
unsafe fn boot(boot_info: &KernelBootInfo) -> Result<TrapFrame, BootError> {
    info!("kernel starting");

    let regions = unsafe { memory_map(boot_info)? };
    let bitmap = unsafe { BitmapFrameAlloc::from_memory_map(regions, &MAPPER)? };
    let frames = FRAMES
        .set(LockedFrameAlloc::new(bitmap))
        .map_err(|_| BootError::AlreadyInitialized("frame allocator"))?;

    unsafe {
        gdt::init();
        idt::init();
        apic::enable()?;
    }

    let kernel_root = unsafe { Cr3::load_unsafe() }.pml4();
    let mut kernel = Kernel::new(&MAPPER, kernel_root, frames, X86Cpu, DebugConsole);

    let image = unsafe { init_image(boot_info)? };
    let init = kernel.spawn(image, None)?;
    info!("init is {init}, {} bytes", image.len());

    let first = kernel.start();
    KERNEL
        .set(SpinLock::new(kernel))
        .map_err(|_| BootError::AlreadyInitialized("kernel"))?;

    unsafe { apic::start_timer() };
    Ok(first)
}

/// # Safety
/// The handoff's region pointer must be valid for `region_count` entries
/// and outside usable memory.
unsafe fn memory_map(boot_info: &KernelBootInfo) -> Result<&'static [MemoryRegion], BootError> {
    let map = &boot_info.memory_map;
    let len = usize::try_from(map.region_count).map_err(|_| BootError::Handoff("region count"))?;
    if map.regions_ptr == 0 || len == 0 {
        return Ok(&[]);
    }
    Ok(unsafe { core::slice::from_raw_parts(map.regions_ptr as *const MemoryRegion, len) })
}

/// # Safety
/// The handoff's image pointer must be valid for `image_len` bytes and
/// outside usable memory.
unsafe fn init_image(boot_info: &KernelBootInfo) -> Result<&'static [u8], BootError> {
    let image = &boot_info.init_image;
    let len = usize::try_from(image.image_len).map_err(|_| BootError::Handoff("init image length"))?;
    if image.image_ptr == 0 || len == 0 {
        return Ok(&[]);
    }
    Ok(unsafe { core::slice::from_raw_parts(image.image_ptr as *const u8, len) })
}

/// Mask interrupts and stop this CPU for good.
pub fn halt_forever() -> ! {
    kernel_sync::irq::cli_stop_interrupts();
    loop {
        #[cfg(target_os = "none")]
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
        }
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    error!("kernel panic: {info}");
    halt_forever()
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("the kernel is built for x86_64-unknown-none and runs under QEMU");
}
