//! # QEMU Debug Console
//!
//! Output for kernels running under QEMU with `-debugcon`: every byte written
//! to I/O port `0x402` shows up on the host.
//!
//! ```text
//! log::info!(..) ──► QemuLogger ──┐
//! qemu_trace!(..) ────────────────┼──► QemuSink ──► out 0x402 ──► host
//! write(1, buf, n) ──► write_bytes┘
//! ```
//!
//! Nothing allocates. With the `enabled` feature off (or on a hosted target)
//! every write is a no-op, so the formatting paths stay testable.
//!
//! ```bash
//! qemu-system-x86_64 ... -debugcon stdio
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::QemuLogger;

#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// QEMU's debug console port.
    #[cfg(all(feature = "enabled", target_os = "none"))]
    const QEMU_DEBUG_PORT: u16 = 0x402;

    /// Write a single byte to the debug console.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        #[cfg(all(feature = "enabled", target_os = "none"))]
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }
        #[cfg(not(all(feature = "enabled", target_os = "none")))]
        let _ = c;
    }

    /// `fmt::Write` adapter over the debug console.
    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            s.bytes().for_each(dbg_putc);
            Ok(())
        }
    }

    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // best effort; the sink itself never fails
        let _ = fmt::write(&mut QemuSink, args);
    }
}

/// Copy raw bytes to the debug console.
pub fn write_bytes(bytes: &[u8]) {
    bytes.iter().copied().for_each(qemu_fmt::dbg_putc);
}

/// `print!`-style output straight to the debug console, usable before the
/// logger is installed.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
